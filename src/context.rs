//! The decode environment and per-instance decode state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use crate::descriptor::{Binding, FieldDescriptor};
use crate::errors::{DecodeError, SynthesisError};
use crate::layout::{Layout, LayoutCatalog};
use crate::schema::{StructMapped, decode_at};
use crate::source::ByteSource;

/// The decode environment: a byte source plus the layout catalog.
///
/// Shared across decodes via [`Arc`]. The source sits behind a mutex because
/// it carries a single cursor; decodes of one instance are strictly
/// sequential against it.
pub struct Mapper {
    source: Mutex<Box<dyn ByteSource>>,
    catalog: RwLock<LayoutCatalog>,
    synth_category: String,
}

impl Mapper {
    pub fn new(source: impl ByteSource + 'static) -> Self {
        Mapper::with_catalog(source, LayoutCatalog::new())
    }

    pub fn with_catalog(source: impl ByteSource + 'static, catalog: LayoutCatalog) -> Self {
        Mapper {
            source: Mutex::new(Box::new(source)),
            catalog: RwLock::new(catalog),
            synth_category: "auto".to_string(),
        }
    }

    /// Category path under which synthesized layouts are registered.
    pub fn synth_category(mut self, category: &str) -> Self {
        self.synth_category = category.to_string();
        self
    }

    pub fn register_layout(
        &self,
        category: &str,
        layout: Layout,
    ) -> Result<Arc<Layout>, SynthesisError> {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(category, layout)
    }

    /// Registers a synthesized layout under the mapper's synthesis category.
    pub(crate) fn register_synthesized(
        &self,
        layout: Layout,
    ) -> Result<Arc<Layout>, SynthesisError> {
        self.register_layout(&self.synth_category, layout)
    }

    pub fn resolve_layout(&self, name: &str) -> Option<Arc<Layout>> {
        self.catalog().resolve(name)
    }

    pub(crate) fn catalog(&self) -> RwLockReadGuard<'_, LayoutCatalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn source(&self) -> MutexGuard<'_, Box<dyn ByteSource>> {
        self.source.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("synth_category", &self.synth_category)
            .finish_non_exhaustive()
    }
}

/// Per-instance decode state: the borrowed environment, the structure's
/// start offset and its end offset, which advances monotonically as fields
/// are consumed.
///
/// The instance under construction moves through the decode call itself and
/// is returned to the caller; the context tracks everything else.
pub struct DecodeContext {
    pub(crate) mapper: Arc<Mapper>,
    pub(crate) base_name: String,
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl DecodeContext {
    pub(crate) fn new(mapper: Arc<Mapper>, base_name: String, start: u64) -> Self {
        DecodeContext {
            mapper,
            base_name,
            start,
            end: start,
        }
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    /// Start offset of the structure, fixed at creation.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Offset one past the last consumed byte.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub(crate) fn advance_to(&mut self, pos: u64) {
        self.end = self.end.max(pos);
    }

    /// Snapshot of this context, retainable beyond the decode.
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            mapper: self.mapper.clone(),
            layout_name: self.base_name.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

/// Retainable, cloneable view of a decode context: the environment plus the
/// structure's offsets.
///
/// Captured by context fields so a decoded instance can later re-derive
/// information (synthesize a layout, re-fetch raw bytes) without threading
/// the environment through every call.
#[derive(Clone)]
pub struct ContextHandle {
    pub mapper: Arc<Mapper>,
    pub layout_name: String,
    pub start: u64,
    pub end: u64,
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mapper, &other.mapper)
            && self.layout_name == other.layout_name
            && self.start == other.start
            && self.end == other.end
    }
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("layout_name", &self.layout_name)
            .field("start", &self.start)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

/// Transient per-field view: a decode context plus one field descriptor.
///
/// Handed to read strategies; not retained beyond the call that consumes it.
/// Exposes the partially populated instance so variable-length reads can be
/// sized from fields decoded earlier.
pub struct FieldDecodeContext<'a, T> {
    pub(crate) ctx: &'a mut DecodeContext,
    pub(crate) field: &'a FieldDescriptor<T>,
    pub(crate) instance: &'a T,
}

impl<'a, T> FieldDecodeContext<'a, T> {
    pub fn field(&self) -> &FieldDescriptor<T> {
        self.field
    }

    /// The instance under construction, populated up to the previous field.
    pub fn instance(&self) -> &T {
        self.instance
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.ctx.mapper
    }

    pub fn structure_start(&self) -> u64 {
        self.ctx.start
    }

    /// Absolute offset of this field.
    ///
    /// Eager bindings resolve against the structure start. Late bindings
    /// resolve by name against a layout registered under the base name, or
    /// fall back to the next unread position for sequential records.
    pub fn field_offset(&self) -> Result<u64, DecodeError> {
        match &self.field.binding {
            Binding::Eager { offset, .. } => Ok(self.ctx.start + offset),
            Binding::Late { name } => match self.ctx.mapper.resolve_layout(&self.ctx.base_name) {
                Some(layout) => layout
                    .component(name)
                    .map(|component| self.ctx.start + component.offset)
                    .ok_or_else(|| DecodeError::UnresolvedField {
                        field: name.clone(),
                        layout: layout.name.clone(),
                    }),
                None => Ok(self.ctx.end),
            },
        }
    }

    /// Length of this field in bytes: the explicit override, else the bound
    /// component length.
    pub fn field_length(&self) -> Result<usize, DecodeError> {
        if let Some(length) = self.field.length {
            return Ok(length);
        }
        match &self.field.binding {
            Binding::Eager { length, .. } => Ok(*length),
            Binding::Late { .. } => Err(DecodeError::MissingLength(self.field.name.to_string())),
        }
    }

    /// Reads the field as an unsigned integer.
    pub fn read_uint(&mut self) -> Result<u64, DecodeError> {
        let offset = self.field_offset()?;
        let length = self.field_length()?;
        let value = {
            let mut source = self.ctx.mapper.source();
            source.set_position(offset)?;
            source.read_uint(length, self.field.endian)?
        };
        self.ctx.advance_to(offset + length as u64);
        Ok(value)
    }

    /// Reads the field as a sign-extended integer.
    pub fn read_int(&mut self) -> Result<i64, DecodeError> {
        let offset = self.field_offset()?;
        let length = self.field_length()?;
        let value = {
            let mut source = self.ctx.mapper.source();
            source.set_position(offset)?;
            source.read_int(length, self.field.endian)?
        };
        self.ctx.advance_to(offset + length as u64);
        Ok(value)
    }

    /// Reads the field's raw bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let offset = self.field_offset()?;
        let length = self.field_length()?;
        let bytes = self.ctx.mapper.source().read_bytes_at(offset, length)?;
        self.ctx.advance_to(offset + length as u64);
        Ok(bytes)
    }

    /// Reads `len` bytes at the field's offset, for strategies that size the
    /// read from the instance rather than from the binding.
    pub fn read_bytes_n(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        let offset = self.field_offset()?;
        let bytes = self.ctx.mapper.source().read_bytes_at(offset, len)?;
        self.ctx.advance_to(offset + len as u64);
        Ok(bytes)
    }

    /// Reads a null-terminated string at the field's offset. Self-sizing.
    pub fn read_cstr(&mut self) -> Result<String, DecodeError> {
        let offset = self.field_offset()?;
        let (value, consumed_to) = {
            let mut source = self.ctx.mapper.source();
            source.set_position(offset)?;
            let value = source.read_cstr()?;
            (value, source.position())
        };
        self.ctx.advance_to(consumed_to);
        Ok(value)
    }

    /// Decodes a nested mapped type at the field's offset.
    pub fn read_nested<U: StructMapped>(&mut self) -> Result<U, DecodeError> {
        let offset = self.field_offset()?;
        let mapper = self.ctx.mapper.clone();
        let nested = decode_at::<U>(&mapper, offset)?;
        let consumed_to = self.ctx.mapper.source().position();
        self.ctx.advance_to(consumed_to);
        Ok(nested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SliceSource;

    #[test]
    fn test_context_end_advances_monotonically() {
        let mapper = Arc::new(Mapper::new(SliceSource::new(vec![0u8; 16])));
        let mut ctx = DecodeContext::new(mapper, "Foo".to_string(), 4);
        assert_eq!(ctx.end(), 4);
        ctx.advance_to(10);
        ctx.advance_to(8);
        assert_eq!(ctx.end(), 10);
    }

    #[test]
    fn test_handle_equality() {
        let mapper = Arc::new(Mapper::new(SliceSource::new(vec![0u8; 4])));
        let ctx = DecodeContext::new(mapper.clone(), "Foo".to_string(), 0);
        assert_eq!(ctx.handle(), ctx.handle());

        let other_mapper = Arc::new(Mapper::new(SliceSource::new(vec![0u8; 4])));
        let other = DecodeContext::new(other_mapper, "Foo".to_string(), 0);
        assert_ne!(ctx.handle(), other.handle());
    }
}
