//! Per-field metadata: the declarations supplied at registration and the
//! resolved descriptors owned by a built schema.

use std::any::{Any, TypeId, type_name};

use crate::errors::DecodeError;
use crate::source::Endian;
use crate::strategy::{MarkupStrategy, OutputStrategy, ReadStrategy};
use crate::value::Value;

/// Signedness of an integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signedness {
    #[default]
    Unspecified,
    Signed,
    Unsigned,
}

/// How a field's byte range is located.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Offset and length resolved at schema-build time against a fixed layout.
    Eager { offset: u64, length: usize },
    /// Resolved by component name at decode time (variable-length records).
    Late { name: String },
}

pub type FieldSetter<T> = Box<dyn Fn(&mut T, Value) -> Result<(), DecodeError> + Send + Sync>;

/// Immutable per-field metadata owned by a built [`crate::schema::TypeSchema`].
pub struct FieldDescriptor<T> {
    pub name: &'static str,
    pub binding: Binding,
    pub signedness: Signedness,
    pub endian: Endian,
    /// Explicit length override; falls back to the bound component length.
    pub length: Option<usize>,
    /// Unresolved strategies surface as a [`DecodeError`], not a schema error.
    pub read: Option<ReadStrategy<T>>,
    pub(crate) assign: FieldSetter<T>,
    pub(crate) markup: Vec<MarkupStrategy<T>>,
}

/// Output metadata for one field of a variable-length record.
///
/// Carries the identity of the field it wraps; ordinals define emission
/// order, independent of declaration order, and are unique per schema.
pub struct OutputFieldDescriptor<T> {
    pub field_name: &'static str,
    /// Component name emitted into the synthesized layout.
    pub component: String,
    pub length: Option<usize>,
    pub ordinal: u32,
    /// Explicit target offset in the synthesized layout.
    pub offset: Option<u64>,
    pub variable_length: bool,
    pub strategy: OutputStrategy<T>,
}

/// Declaration of one mapped field, supplied by
/// [`crate::schema::StructMapped::type_def`]. Built into a
/// [`FieldDescriptor`] when the schema is constructed.
pub struct FieldDecl<T> {
    pub(crate) name: &'static str,
    pub(crate) binding_name: Option<&'static str>,
    pub(crate) signedness: Signedness,
    pub(crate) endian: Endian,
    pub(crate) length: Option<usize>,
    pub(crate) read: Option<ReadStrategy<T>>,
    pub(crate) assign: Option<FieldSetter<T>>,
    pub(crate) markup: Vec<MarkupStrategy<T>>,
    pub(crate) output: Option<OutputDecl<T>>,
}

impl<T> FieldDecl<T> {
    pub fn new(name: &'static str) -> Self {
        FieldDecl {
            name,
            binding_name: None,
            signedness: Signedness::Unspecified,
            endian: Endian::Little,
            length: None,
            read: None,
            assign: None,
            markup: Vec::new(),
            output: None,
        }
    }

    /// Binds to a layout component whose name differs from the field name.
    pub fn binding(mut self, component: &'static str) -> Self {
        self.binding_name = Some(component);
        self
    }

    pub fn signed(mut self) -> Self {
        self.signedness = Signedness::Signed;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.signedness = Signedness::Unsigned;
        self
    }

    pub fn endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Explicit length in bytes, overriding the bound component length.
    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn read(mut self, strategy: ReadStrategy<T>) -> Self {
        self.read = Some(strategy);
        self
    }

    /// Assigns the produced [`Value`] into the instance. Required for every
    /// mapped field of a non-self-reading type.
    pub fn assign(
        mut self,
        set: impl Fn(&mut T, Value) -> Result<(), DecodeError> + Send + Sync + 'static,
    ) -> Self {
        self.assign = Some(Box::new(set));
        self
    }

    pub fn markup(mut self, strategy: MarkupStrategy<T>) -> Self {
        self.markup.push(strategy);
        self
    }

    /// Registers this field in the output set used for layout synthesis.
    pub fn output(mut self, decl: OutputDecl<T>) -> Self {
        self.output = Some(decl);
        self
    }
}

/// Output declaration attached to a [`FieldDecl`].
pub struct OutputDecl<T> {
    pub(crate) ordinal: u32,
    pub(crate) offset: Option<u64>,
    pub(crate) variable_length: bool,
    pub(crate) strategy: OutputStrategy<T>,
}

impl<T> OutputDecl<T> {
    pub fn new(ordinal: u32, strategy: OutputStrategy<T>) -> Self {
        OutputDecl {
            ordinal,
            offset: None,
            variable_length: false,
            strategy,
        }
    }

    /// Emits the field at an explicit offset in the synthesized layout.
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Marks the field variable-length; its size delta suffixes the
    /// synthesized layout name.
    pub fn variable_length(mut self) -> Self {
        self.variable_length = true;
        self
    }
}

pub(crate) type ContextSetter<T> =
    Box<dyn Fn(&mut T, Box<dyn Any>) -> Result<(), DecodeError> + Send + Sync>;

/// Declaration of a context field: populated after decode with the
/// environment or the decode context, selected by the declared type.
pub struct ContextFieldDecl<T> {
    pub(crate) name: &'static str,
    pub(crate) declared: TypeId,
    pub(crate) declared_name: &'static str,
    pub(crate) assign: ContextSetter<T>,
}

impl<T> ContextFieldDecl<T> {
    /// Declares a context field of type `D`. Injection accepts
    /// [`std::sync::Arc`]`<`[`crate::context::Mapper`]`>` (the environment) or
    /// [`crate::context::ContextHandle`] (the decode context); any other `D`
    /// fails the decode.
    pub fn new<D, F>(name: &'static str, set: F) -> Self
    where
        D: 'static,
        F: Fn(&mut T, D) + Send + Sync + 'static,
    {
        ContextFieldDecl {
            name,
            declared: TypeId::of::<D>(),
            declared_name: type_name::<D>(),
            assign: Box::new(move |instance, value| {
                let value = value.downcast::<D>().map_err(|_| {
                    DecodeError::Invalid(format!("context value type mismatch for field `{name}`"))
                })?;
                set(instance, *value);
                Ok(())
            }),
        }
    }
}
