//! Type schemas: per-type registration, the build step, the process-wide
//! cache, decode, layout synthesis and the markup pass.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::context::{ContextHandle, DecodeContext, FieldDecodeContext, Mapper};
use crate::descriptor::{
    Binding, ContextFieldDecl, FieldDecl, FieldDescriptor, OutputFieldDescriptor, Signedness,
};
use crate::errors::{DecodeError, SchemaError, SynthesisError};
use crate::layout::{Layout, LayoutBuilder};
use crate::markup::{CommentKind, MarkupFailure, MarkupReport, MarkupSession};
use crate::source::ByteSource;
use crate::strategy::{MarkupProvider, MarkupStrategy, OutputStrategy, ReadStrategy};
use crate::value::Value;

/// Implemented by every structure mapped type.
///
/// `type_def` is the declarative registration replacing per-type decode
/// code: each field states how its value is obtained from the layout.
pub trait StructMapped: Sized + 'static {
    fn type_def() -> TypeDef<Self>;
}

pub type SelfReadFn<T> =
    Box<dyn Fn(&mut T, &mut dyn ByteSource) -> Result<(), DecodeError> + Send + Sync>;
pub type HookFn<T> = Box<dyn Fn(&mut T) -> Result<(), DecodeError> + Send + Sync>;
pub type ConstructFn<T> =
    Box<dyn Fn(&DecodeContext) -> Result<T, DecodeError> + Send + Sync>;
pub type ContextGetter<T> = Box<dyn Fn(&T) -> Option<ContextHandle> + Send + Sync>;

/// How instances are created before their fields are populated. Construction
/// with a context is preferred; a plain constructor is the fallback.
enum Construct<T> {
    WithContext(ConstructFn<T>),
    Plain(Box<dyn Fn() -> T + Send + Sync>),
}

/// Declarative registration for a structure mapped type.
///
/// Declaration order is decode order; a type composed from a base declares
/// the base's fields first.
pub struct TypeDef<T> {
    base_name: String,
    fields: Vec<FieldDecl<T>>,
    self_read: Option<SelfReadFn<T>>,
    construct_with: Option<ConstructFn<T>>,
    construct_plain: Option<Box<dyn Fn() -> T + Send + Sync>>,
    context_fields: Vec<ContextFieldDecl<T>>,
    hooks: Vec<HookFn<T>>,
    providers: Vec<MarkupProvider<T>>,
    context_getter: Option<ContextGetter<T>>,
}

impl<T: 'static> TypeDef<T> {
    /// Starts a field-mapped registration bound to layout `base_name`.
    pub fn mapped(base_name: &str) -> Self {
        TypeDef {
            base_name: base_name.to_string(),
            fields: Vec::new(),
            self_read: None,
            construct_with: None,
            construct_plain: None,
            context_fields: Vec::new(),
            hooks: Vec::new(),
            providers: Vec::new(),
            context_getter: None,
        }
    }

    /// Starts a self-reading registration: `read` consumes the type's bytes
    /// end to end through the provided source, bypassing per-field dispatch.
    /// Field declarations on such a type contribute output metadata only.
    pub fn self_reading(
        base_name: &str,
        read: impl Fn(&mut T, &mut dyn ByteSource) -> Result<(), DecodeError> + Send + Sync + 'static,
    ) -> Self {
        let mut def = TypeDef::mapped(base_name);
        def.self_read = Some(Box::new(read));
        def
    }

    pub fn field(mut self, decl: FieldDecl<T>) -> Self {
        self.fields.push(decl);
        self
    }

    /// Registers a constructor receiving the decode context.
    pub fn construct_with(
        mut self,
        construct: impl Fn(&DecodeContext) -> Result<T, DecodeError> + Send + Sync + 'static,
    ) -> Self {
        self.construct_with = Some(Box::new(construct));
        self
    }

    /// Registers `T::default` as the fallback constructor.
    pub fn construct_default(mut self) -> Self
    where
        T: Default,
    {
        self.construct_plain = Some(Box::new(T::default));
        self
    }

    pub fn context_field(mut self, decl: ContextFieldDecl<T>) -> Self {
        self.context_fields.push(decl);
        self
    }

    /// Post-decode hook, invoked with the fully populated instance. The
    /// first failure aborts the decode.
    pub fn after_decode(
        mut self,
        hook: impl Fn(&mut T) -> Result<(), DecodeError> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// Plate comment at the structure start during the markup pass.
    pub fn plate_comment(
        mut self,
        render: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.providers.push(MarkupProvider::PlateComment(Box::new(render)));
        self
    }

    pub fn markup(mut self, provider: MarkupProvider<T>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Registers the getter used by [`TypeSchema::context_of`] to recover a
    /// captured context handle from a decoded instance.
    pub fn capture_context(
        mut self,
        get: impl Fn(&T) -> Option<ContextHandle> + Send + Sync + 'static,
    ) -> Self {
        self.context_getter = Some(Box::new(get));
        self
    }
}

/// Whether a schema decodes field by field or delegates to the type.
enum SchemaKind<T> {
    Mapped(Vec<FieldDescriptor<T>>),
    SelfReading(SelfReadFn<T>),
}

/// Immutable, process-cached description of how a type maps onto a layout.
///
/// Built once per type on first request and shared read-only across all
/// decodes of that type.
pub struct TypeSchema<T> {
    type_name: &'static str,
    base_name: String,
    /// Fixed layout resolved at build time; `None` for variable-length types.
    layout: Option<Arc<Layout>>,
    kind: SchemaKind<T>,
    /// Sorted by ordinal; ordinals are unique.
    output_fields: Vec<OutputFieldDescriptor<T>>,
    construct: Construct<T>,
    context_fields: Vec<ContextFieldDecl<T>>,
    hooks: Vec<HookFn<T>>,
    providers: Vec<MarkupProvider<T>>,
    context_getter: Option<ContextGetter<T>>,
}

impl<T: 'static> TypeSchema<T> {
    fn build(def: TypeDef<T>, layout: Option<Arc<Layout>>) -> Result<Self, SchemaError> {
        let type_name = std::any::type_name::<T>();
        let self_reading = def.self_read.is_some();

        let mut fields = Vec::with_capacity(def.fields.len());
        let mut output_fields: Vec<OutputFieldDescriptor<T>> = Vec::new();

        for decl in def.fields {
            let component_name = decl.binding_name.unwrap_or(decl.name);
            let binding = match (&layout, self_reading) {
                (Some(layout), false) => {
                    let component = layout.component(component_name).ok_or_else(|| {
                        SchemaError::MissingBinding {
                            field: component_name.to_string(),
                            layout: layout.name.clone(),
                        }
                    })?;
                    Binding::Eager {
                        offset: component.offset,
                        length: component.length,
                    }
                }
                _ => Binding::Late {
                    name: component_name.to_string(),
                },
            };

            if let Some(output) = decl.output {
                if output_fields.iter().any(|o| o.ordinal == output.ordinal) {
                    return Err(SchemaError::DuplicateOrdinal {
                        ordinal: output.ordinal,
                        field: decl.name.to_string(),
                    });
                }
                let bound_length = match &binding {
                    Binding::Eager { length, .. } => Some(*length),
                    Binding::Late { .. } => None,
                };
                output_fields.push(OutputFieldDescriptor {
                    field_name: decl.name,
                    component: component_name.to_string(),
                    length: decl.length.or(bound_length),
                    ordinal: output.ordinal,
                    offset: output.offset,
                    variable_length: output.variable_length,
                    strategy: output.strategy,
                });
            }

            if !self_reading {
                let assign = decl
                    .assign
                    .ok_or_else(|| SchemaError::MissingSetter(decl.name.to_string()))?;
                fields.push(FieldDescriptor {
                    name: decl.name,
                    binding,
                    signedness: decl.signedness,
                    endian: decl.endian,
                    length: decl.length,
                    read: decl.read,
                    assign,
                    markup: decl.markup,
                });
            }
        }

        output_fields.sort_by_key(|o| o.ordinal);

        let construct = match (def.construct_with, def.construct_plain) {
            (Some(with_context), _) => Construct::WithContext(with_context),
            (None, Some(plain)) => Construct::Plain(plain),
            (None, None) => return Err(SchemaError::NoConstructor(type_name)),
        };

        let kind = match def.self_read {
            Some(read) => SchemaKind::SelfReading(read),
            None => SchemaKind::Mapped(fields),
        };

        Ok(TypeSchema {
            type_name,
            base_name: def.base_name,
            layout,
            kind,
            output_fields,
            construct,
            context_fields: def.context_fields,
            hooks: def.hooks,
            providers: def.providers,
            context_getter: def.context_getter,
        })
    }

    /// `Type-Layout`, for diagnostics.
    pub fn description(&self) -> String {
        let short = self.type_name.rsplit("::").next().unwrap_or(self.type_name);
        format!("{}-{}", short, self.base_name)
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// The fixed layout, or `None` for variable-length types.
    pub fn layout(&self) -> Option<&Arc<Layout>> {
        self.layout.as_ref()
    }

    pub fn output_fields(&self) -> &[OutputFieldDescriptor<T>] {
        &self.output_fields
    }

    /// Recovers the context handle captured by a decoded instance.
    pub fn context_of(&self, instance: &T) -> Option<ContextHandle> {
        self.context_getter.as_ref().and_then(|get| get(instance))
    }

    /// Decodes one instance at `offset`, driving the full pipeline:
    /// construction, field reads (or self-read delegation), context-field
    /// injection and post-decode hooks.
    pub fn decode(&self, mapper: &Arc<Mapper>, offset: u64) -> Result<T, DecodeError> {
        let mut ctx = DecodeContext::new(mapper.clone(), self.base_name.clone(), offset);
        let mut instance = match &self.construct {
            Construct::WithContext(construct) => construct(&ctx)?,
            Construct::Plain(construct) => construct(),
        };

        match &self.kind {
            SchemaKind::SelfReading(read) => {
                let mut source = mapper.source();
                source.set_position(offset)?;
                read(&mut instance, source.as_mut())?;
                let end = source.position();
                drop(source);
                ctx.advance_to(end);
            }
            SchemaKind::Mapped(fields) => {
                for field in fields {
                    let value = {
                        let mut field_ctx = FieldDecodeContext {
                            ctx: &mut ctx,
                            field,
                            instance: &instance,
                        };
                        let strategy = field.read.as_ref().ok_or_else(|| {
                            DecodeError::MissingReadStrategy(field.name.to_string())
                        })?;
                        match strategy {
                            ReadStrategy::Scalar => match field.signedness {
                                Signedness::Signed => Value::I64(field_ctx.read_int()?),
                                _ => Value::U64(field_ctx.read_uint()?),
                            },
                            ReadStrategy::FixedBytes => Value::Bytes(field_ctx.read_bytes()?),
                            ReadStrategy::CStr => Value::Str(field_ctx.read_cstr()?),
                            ReadStrategy::Custom(read) => read(&mut field_ctx)?,
                        }
                    };
                    (field.assign)(&mut instance, value)?;
                }
                if let Some(layout) = &self.layout {
                    // Fixed layouts always end at the declared total length,
                    // covering components no field mapped.
                    ctx.advance_to(ctx.start() + layout.length);
                }
                mapper.source().set_position(ctx.end())?;
            }
        }

        for context_field in &self.context_fields {
            if context_field.declared == TypeId::of::<Arc<Mapper>>() {
                (context_field.assign)(&mut instance, Box::new(mapper.clone()))?;
            } else if context_field.declared == TypeId::of::<ContextHandle>() {
                (context_field.assign)(&mut instance, Box::new(ctx.handle()))?;
            } else {
                return Err(DecodeError::UnsupportedContextField {
                    field: context_field.name.to_string(),
                    declared: context_field.declared_name,
                });
            }
        }

        for hook in &self.hooks {
            hook(&mut instance)?;
        }

        Ok(instance)
    }

    /// Synthesizes a layout for a variable-length instance and registers it
    /// under the mapper's synthesis category.
    ///
    /// Output strategies append in ordinal order; each variable-length
    /// field's size delta suffixes the layout name, so instances with
    /// different variable sizes resolve to distinct layouts.
    pub fn synthesize_layout(
        &self,
        instance: &T,
        mapper: &Mapper,
    ) -> Result<Arc<Layout>, SynthesisError> {
        if self.layout.is_some() {
            return Err(SynthesisError::FixedLayout(self.type_name));
        }

        let mut builder = LayoutBuilder::new(&self.base_name);
        let mut suffix = String::new();
        for output in &self.output_fields {
            let length_before = builder.length();
            match &output.strategy {
                OutputStrategy::Component => {
                    let length = output.length.ok_or_else(|| SynthesisError::OutputFailed {
                        field: output.field_name.to_string(),
                        reason: "missing length".to_string(),
                    })?;
                    match output.offset {
                        Some(offset) => {
                            builder.append_at(&output.component, offset, length)?;
                        }
                        None => {
                            builder.append(&output.component, length);
                        }
                    }
                }
                OutputStrategy::Custom(append) => append(instance, &mut builder)?,
            }
            let delta = builder.length() - length_before;
            if output.variable_length {
                suffix.push_str(&format!("_{delta}"));
            }
        }
        if !suffix.is_empty() {
            builder.rename(format!("{}{}", self.base_name, suffix))?;
        }

        mapper.register_synthesized(builder.finish()?)
    }

    /// Runs the markup pass: field strategies in declaration order, then
    /// type-level providers.
    ///
    /// Every failure is caught, logged and collected; the pass always runs
    /// to completion. Markup is advisory, so partial application under
    /// malformed data is expected.
    pub fn run_markup(
        &self,
        instance: &T,
        handle: &ContextHandle,
        session: &mut dyn MarkupSession,
    ) -> MarkupReport {
        let mut report = MarkupReport::default();

        if let SchemaKind::Mapped(fields) = &self.kind {
            for field in fields {
                // Late names resolve against the layout the handle names,
                // which for synthesized layouts carries the instance's actual
                // offsets. Unresolvable names anchor at the structure start.
                let location = match &field.binding {
                    Binding::Eager { offset, .. } => handle.start + offset,
                    Binding::Late { name } => handle
                        .mapper
                        .resolve_layout(&handle.layout_name)
                        .and_then(|layout| {
                            layout.component(name).map(|c| handle.start + c.offset)
                        })
                        .unwrap_or(handle.start),
                };
                for strategy in &field.markup {
                    report.attempted += 1;
                    let outcome = match strategy {
                        MarkupStrategy::Comment { kind, render } => match render(instance) {
                            Some(text) => session.append_comment(location, *kind, &text),
                            None => Ok(()),
                        },
                        MarkupStrategy::Reference { target } => match target(instance) {
                            Some(to) => session.add_reference(location, to),
                            None => Ok(()),
                        },
                        MarkupStrategy::Custom(run) => run(instance, handle, session),
                    };
                    if let Err(error) = outcome {
                        let source = format!("{}.{}", self.description(), field.name);
                        warn!(%source, %error, "markup strategy failed");
                        report.failures.push(MarkupFailure { source, error });
                    }
                }
            }
        }

        for provider in &self.providers {
            report.attempted += 1;
            let outcome = match provider {
                MarkupProvider::PlateComment(render) => match render(instance) {
                    Some(text) => session.append_comment(handle.start, CommentKind::Plate, &text),
                    None => Ok(()),
                },
                MarkupProvider::Custom(run) => run(instance, handle, session),
            };
            if let Err(error) = outcome {
                let source = self.description();
                warn!(%source, %error, "markup provider failed");
                report.failures.push(MarkupFailure { source, error });
            }
        }

        report
    }
}

impl<T> fmt::Debug for TypeSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeSchema")
            .field("type_name", &self.type_name)
            .field("base_name", &self.base_name)
            .field("fixed", &self.layout.is_some())
            .finish_non_exhaustive()
    }
}

type SchemaCache = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

static SCHEMA_CACHE: OnceLock<RwLock<SchemaCache>> = OnceLock::new();

fn schema_cache() -> &'static RwLock<SchemaCache> {
    SCHEMA_CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns the cached schema for `T`, building it on first request.
///
/// Builds are pure and deterministic, so concurrent first requests may both
/// build; whichever snapshot is published first wins and the duplicate is
/// dropped. Only fully constructed schemas are published; failed builds are
/// never cached.
pub fn schema_for<T: StructMapped>(mapper: &Mapper) -> Result<Arc<TypeSchema<T>>, SchemaError> {
    let key = TypeId::of::<T>();
    if let Some(cached) = schema_cache()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return Ok(downcast_schema::<T>(cached.clone()));
    }

    let def = T::type_def();
    let layout = mapper.resolve_layout(&def.base_name);
    let built = Arc::new(TypeSchema::build(def, layout)?);
    debug!(
        schema = %built.description(),
        fixed = built.layout.is_some(),
        "built type schema"
    );

    let mut cache = schema_cache()
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    let entry = cache
        .entry(key)
        .or_insert_with(|| {
            let published: Arc<dyn Any + Send + Sync> = built;
            published
        })
        .clone();
    Ok(downcast_schema::<T>(entry))
}

fn downcast_schema<T: StructMapped>(entry: Arc<dyn Any + Send + Sync>) -> Arc<TypeSchema<T>> {
    entry
        .downcast::<TypeSchema<T>>()
        .unwrap_or_else(|_| unreachable!("schema cache entries are keyed by TypeId"))
}

/// Decodes a `T` at `offset` using the process-cached schema.
pub fn decode_at<T: StructMapped>(mapper: &Arc<Mapper>, offset: u64) -> Result<T, DecodeError> {
    let schema = schema_for::<T>(mapper)?;
    schema.decode(mapper, offset)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::descriptor::OutputDecl;
    use crate::errors::MarkupError;
    use crate::markup::MemorySession;
    use crate::source::SliceSource;

    use super::*;

    fn mapper_over(data: Vec<u8>) -> Arc<Mapper> {
        Arc::new(Mapper::new(SliceSource::new(data)))
    }

    #[derive(Default)]
    struct Header {
        field1: u32,
        field2: u32,
        ctx: Option<ContextHandle>,
    }

    impl StructMapped for Header {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Header")
                .construct_default()
                .field(FieldDecl::new("field1").read(ReadStrategy::Scalar).assign(
                    |h: &mut Header, v| {
                        h.field1 = v.expect_u64("field1")? as u32;
                        Ok(())
                    },
                ))
                .field(FieldDecl::new("field2").read(ReadStrategy::Scalar).assign(
                    |h: &mut Header, v| {
                        h.field2 = v.expect_u64("field2")? as u32;
                        Ok(())
                    },
                ))
                .context_field(ContextFieldDecl::new::<ContextHandle, _>(
                    "ctx",
                    |h: &mut Header, c| h.ctx = Some(c),
                ))
                .capture_context(|h| h.ctx.clone())
        }
    }

    fn header_layout() -> Layout {
        Layout::fixed("Header", &[("field1", 4), ("field2", 4)])
    }

    #[test]
    fn test_fixed_decode_end_to_end() {
        let mapper = mapper_over(vec![0x01, 0, 0, 0, 0x02, 0, 0, 0]);
        mapper.register_layout("test", header_layout()).unwrap();

        let header: Header = decode_at(&mapper, 0).unwrap();
        assert_eq!(header.field1, 1);
        assert_eq!(header.field2, 2);

        // End offset is start + declared length; the cursor follows it.
        let handle = header.ctx.as_ref().unwrap();
        assert_eq!(handle.start, 0);
        assert_eq!(handle.end, 8);
        assert_eq!(mapper.source().position(), 8);
    }

    #[test]
    fn test_context_recovery_from_instance() {
        let mapper = mapper_over(vec![0x01, 0, 0, 0, 0x02, 0, 0, 0]);
        mapper.register_layout("test", header_layout()).unwrap();

        let header: Header = decode_at(&mapper, 0).unwrap();
        let schema = schema_for::<Header>(&mapper).unwrap();
        let recovered = schema.context_of(&header).unwrap();
        assert_eq!(recovered, header.ctx.clone().unwrap());
        assert_eq!(schema.description(), "Header-Header");
    }

    #[derive(Default)]
    struct Swapped {
        a: u32,
        b: u16,
    }

    impl StructMapped for Swapped {
        fn type_def() -> TypeDef<Self> {
            // `b` is declared (and read) before `a`, but `a` has the lower
            // output ordinal.
            TypeDef::mapped("Swapped")
                .construct_default()
                .field(
                    FieldDecl::new("b")
                        .length(2)
                        .read(ReadStrategy::Scalar)
                        .assign(|s: &mut Swapped, v| {
                            s.b = v.expect_u64("b")? as u16;
                            Ok(())
                        })
                        .output(OutputDecl::new(2, OutputStrategy::Component)),
                )
                .field(
                    FieldDecl::new("a")
                        .length(4)
                        .read(ReadStrategy::Scalar)
                        .assign(|s: &mut Swapped, v| {
                            s.a = v.expect_u64("a")? as u32;
                            Ok(())
                        })
                        .output(OutputDecl::new(1, OutputStrategy::Component)),
                )
        }
    }

    #[test]
    fn test_output_ordinal_governs_emission_order() {
        let mapper = mapper_over(vec![0u8; 8]);
        let schema = schema_for::<Swapped>(&mapper).unwrap();
        let layout = schema
            .synthesize_layout(&Swapped::default(), &mapper)
            .unwrap();
        assert_eq!(layout.components[0].name, "a");
        assert_eq!(layout.components[1].name, "b");
        assert_eq!(layout.components[1].offset, 4);
        assert_eq!(layout.length, 6);
    }

    static SELF_READS: AtomicUsize = AtomicUsize::new(0);
    static FIELD_READS: AtomicUsize = AtomicUsize::new(0);

    struct Raw {
        bytes: Vec<u8>,
    }

    impl StructMapped for Raw {
        fn type_def() -> TypeDef<Self> {
            TypeDef::self_reading("Raw", |raw: &mut Raw, source: &mut dyn ByteSource| {
                SELF_READS.fetch_add(1, Ordering::Relaxed);
                raw.bytes = source.read_bytes(4)?;
                Ok(())
            })
            .construct_with(|_| Ok(Raw { bytes: Vec::new() }))
            // Ignored by decode: self-reading types never dispatch per field.
            .field(
                FieldDecl::new("ignored").read(ReadStrategy::Custom(Box::new(|_| {
                    FIELD_READS.fetch_add(1, Ordering::Relaxed);
                    Ok(Value::U64(0))
                }))),
            )
        }
    }

    #[test]
    fn test_self_reading_bypasses_field_dispatch() {
        let mapper = mapper_over(vec![9, 8, 7, 6, 5]);
        let raw: Raw = decode_at(&mapper, 1).unwrap();
        assert_eq!(raw.bytes, vec![8, 7, 6, 5]);
        assert_eq!(SELF_READS.load(Ordering::Relaxed), 1);
        assert_eq!(FIELD_READS.load(Ordering::Relaxed), 0);
    }

    #[derive(Default)]
    struct Unbindable {
        missing: u32,
    }

    impl StructMapped for Unbindable {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Partial")
                .construct_default()
                .field(FieldDecl::new("missing").read(ReadStrategy::Scalar).assign(
                    |u: &mut Unbindable, v| {
                        u.missing = v.expect_u64("missing")? as u32;
                        Ok(())
                    },
                ))
        }
    }

    #[test]
    fn test_missing_binding_is_a_schema_error() {
        let mapper = mapper_over(vec![0u8; 8]);
        mapper
            .register_layout("test", Layout::fixed("Partial", &[("present", 4)]))
            .unwrap();

        let err = schema_for::<Unbindable>(&mapper).unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingBinding {
                field: "missing".to_string(),
                layout: "Partial".to_string(),
            }
        );
        // Failed builds are never published; a later request fails the same way.
        assert!(schema_for::<Unbindable>(&mapper).is_err());
    }

    #[derive(Default)]
    struct Blob {
        size: u32,
        data: Vec<u8>,
    }

    impl StructMapped for Blob {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Blob")
                .construct_default()
                .field(
                    FieldDecl::new("size")
                        .length(4)
                        .read(ReadStrategy::Scalar)
                        .assign(|b: &mut Blob, v| {
                            b.size = v.expect_u64("size")? as u32;
                            Ok(())
                        })
                        .output(OutputDecl::new(1, OutputStrategy::Component)),
                )
                .field(
                    FieldDecl::new("data")
                        .read(ReadStrategy::Custom(Box::new(
                            |fctx: &mut FieldDecodeContext<Blob>| {
                                let len = fctx.instance().size as usize;
                                Ok(Value::Bytes(fctx.read_bytes_n(len)?))
                            },
                        )))
                        .assign(|b: &mut Blob, v| {
                            b.data = v.expect_bytes("data")?;
                            Ok(())
                        })
                        .output(
                            OutputDecl::new(
                                2,
                                OutputStrategy::Custom(Box::new(|b: &Blob, builder| {
                                    builder.append("data", b.data.len());
                                    Ok(())
                                })),
                            )
                            .variable_length(),
                        ),
                )
        }
    }

    #[test]
    fn test_variable_length_synthesis_gets_size_suffix() {
        let mut data = vec![4, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD];
        data.extend([8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
        let mapper = mapper_over(data);

        let small: Blob = decode_at(&mapper, 0).unwrap();
        assert_eq!(small.size, 4);
        assert_eq!(small.data, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(mapper.source().position(), 8);

        let large: Blob = decode_at(&mapper, 8).unwrap();
        assert_eq!(large.data.len(), 8);

        let schema = schema_for::<Blob>(&mapper).unwrap();
        let small_layout = schema.synthesize_layout(&small, &mapper).unwrap();
        let large_layout = schema.synthesize_layout(&large, &mapper).unwrap();
        assert_eq!(small_layout.name, "Blob_4");
        assert_eq!(large_layout.name, "Blob_8");
        assert_eq!(small_layout.length, 8);
        assert_eq!(large_layout.length, 12);
        assert_eq!(small_layout.category, "auto");

        // Both names stay resolvable; no collision.
        assert!(mapper.resolve_layout("Blob_4").is_some());
        assert!(mapper.resolve_layout("Blob_8").is_some());
    }

    #[test]
    fn test_synthesis_rejected_for_fixed_layouts() {
        let mapper = mapper_over(vec![0x01, 0, 0, 0, 0x02, 0, 0, 0]);
        mapper.register_layout("test", header_layout()).unwrap();
        let header: Header = decode_at(&mapper, 0).unwrap();
        let schema = schema_for::<Header>(&mapper).unwrap();
        assert!(matches!(
            schema.synthesize_layout(&header, &mapper).unwrap_err(),
            SynthesisError::FixedLayout(_)
        ));
    }

    #[derive(Default)]
    struct Injected {
        env: Option<Arc<Mapper>>,
        ctx: Option<ContextHandle>,
    }

    impl StructMapped for Injected {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Injected")
                .construct_default()
                .context_field(ContextFieldDecl::new::<Arc<Mapper>, _>(
                    "env",
                    |i: &mut Injected, m| i.env = Some(m),
                ))
                .context_field(ContextFieldDecl::new::<ContextHandle, _>(
                    "ctx",
                    |i: &mut Injected, c| i.ctx = Some(c),
                ))
        }
    }

    #[test]
    fn test_context_fields_receive_environment_and_context() {
        let mapper = mapper_over(vec![0u8; 4]);
        let injected: Injected = decode_at(&mapper, 2).unwrap();
        assert!(Arc::ptr_eq(injected.env.as_ref().unwrap(), &mapper));
        let handle = injected.ctx.unwrap();
        assert!(Arc::ptr_eq(&handle.mapper, &mapper));
        assert_eq!(handle.start, 2);
    }

    #[derive(Debug, Default)]
    struct BadContext {
        label: Option<String>,
    }

    impl StructMapped for BadContext {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("BadContext")
                .construct_default()
                .context_field(ContextFieldDecl::new::<String, _>(
                    "label",
                    |b: &mut BadContext, s| b.label = Some(s),
                ))
        }
    }

    #[test]
    fn test_unsupported_context_field() {
        let mapper = mapper_over(vec![0u8; 4]);
        let err = decode_at::<BadContext>(&mapper, 0).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnsupportedContextField { ref field, .. } if field == "label"
        ));
    }

    #[derive(Default)]
    struct Noted {
        value: u32,
        target: u32,
    }

    impl StructMapped for Noted {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Noted")
                .construct_default()
                .field(
                    FieldDecl::new("value")
                        .read(ReadStrategy::Scalar)
                        .assign(|n: &mut Noted, v| {
                            n.value = v.expect_u64("value")? as u32;
                            Ok(())
                        })
                        .markup(MarkupStrategy::custom(|_, _, _| {
                            Err(MarkupError::Failed("broken".to_string()))
                        }))
                        .markup(MarkupStrategy::comment(CommentKind::Eol, |n: &Noted| {
                            Some(format!("value={}", n.value))
                        })),
                )
                .field(
                    FieldDecl::new("target")
                        .read(ReadStrategy::Scalar)
                        .assign(|n: &mut Noted, v| {
                            n.target = v.expect_u64("target")? as u32;
                            Ok(())
                        })
                        .markup(MarkupStrategy::reference(|n: &Noted| {
                            Some(n.target as u64)
                        })),
                )
                .plate_comment(|n| Some(format!("noted {}", n.value)))
        }
    }

    #[test]
    fn test_markup_failures_do_not_abort_the_pass() {
        let mapper = mapper_over(vec![7, 0, 0, 0, 32, 0, 0, 0]);
        mapper
            .register_layout("test", Layout::fixed("Noted", &[("value", 4), ("target", 4)]))
            .unwrap();

        let noted: Noted = decode_at(&mapper, 0).unwrap();
        let schema = schema_for::<Noted>(&mapper).unwrap();
        let handle = ContextHandle {
            mapper: mapper.clone(),
            layout_name: "Noted".to_string(),
            start: 0,
            end: 8,
        };

        let mut session = MemorySession::new();
        let report = schema.run_markup(&noted, &handle, &mut session);

        assert_eq!(report.attempted, 4);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.fully_applied());
        assert_eq!(
            report.failures[0].error,
            MarkupError::Failed("broken".to_string())
        );

        // The failing strategy did not stop the others.
        assert_eq!(
            session.comments,
            vec![
                (0, CommentKind::Eol, "value=7".to_string()),
                (0, CommentKind::Plate, "noted 7".to_string()),
            ]
        );
        assert_eq!(session.references, vec![(4, 32)]);
    }

    #[derive(Default)]
    struct Framed {
        size: u32,
        body: Vec<u8>,
    }

    impl StructMapped for Framed {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Framed")
                .construct_default()
                .field(
                    FieldDecl::new("size")
                        .length(4)
                        .read(ReadStrategy::Scalar)
                        .assign(|f: &mut Framed, v| {
                            f.size = v.expect_u64("size")? as u32;
                            Ok(())
                        })
                        .output(OutputDecl::new(1, OutputStrategy::Component)),
                )
                .field(
                    FieldDecl::new("body")
                        .read(ReadStrategy::Custom(Box::new(
                            |fctx: &mut FieldDecodeContext<Framed>| {
                                let len = fctx.instance().size as usize;
                                Ok(Value::Bytes(fctx.read_bytes_n(len)?))
                            },
                        )))
                        .assign(|f: &mut Framed, v| {
                            f.body = v.expect_bytes("body")?;
                            Ok(())
                        })
                        .markup(MarkupStrategy::comment(CommentKind::Eol, |f: &Framed| {
                            Some(format!("{} body bytes", f.body.len()))
                        }))
                        .output(
                            OutputDecl::new(
                                2,
                                OutputStrategy::Custom(Box::new(|f: &Framed, builder| {
                                    builder.append("body", f.body.len());
                                    Ok(())
                                })),
                            )
                            .variable_length(),
                        ),
                )
        }
    }

    #[test]
    fn test_late_bound_markup_anchors_at_resolved_offset() {
        let mapper = mapper_over(vec![3, 0, 0, 0, 0xAA, 0xBB, 0xCC]);
        let framed: Framed = decode_at(&mapper, 0).unwrap();
        let schema = schema_for::<Framed>(&mapper).unwrap();
        let layout = schema.synthesize_layout(&framed, &mapper).unwrap();
        assert_eq!(layout.name, "Framed_3");

        // A handle naming the synthesized layout resolves the late-bound
        // field to its component offset.
        let handle = ContextHandle {
            mapper: mapper.clone(),
            layout_name: layout.name.clone(),
            start: 0,
            end: 7,
        };
        let mut session = MemorySession::new();
        let report = schema.run_markup(&framed, &handle, &mut session);
        assert!(report.fully_applied());
        assert_eq!(
            session.comments,
            vec![(4, CommentKind::Eol, "3 body bytes".to_string())]
        );

        // Without a resolvable layout the annotation anchors at the start.
        let unresolved = ContextHandle {
            layout_name: "Framed".to_string(),
            ..handle
        };
        let mut session = MemorySession::new();
        schema.run_markup(&framed, &unresolved, &mut session);
        assert_eq!(session.comments[0].0, 0);
    }

    #[derive(Debug, Default)]
    struct Unread {
        value: u32,
    }

    impl StructMapped for Unread {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Unread")
                .construct_default()
                .field(FieldDecl::new("value").length(4).assign(
                    |u: &mut Unread, v| {
                        u.value = v.expect_u64("value")? as u32;
                        Ok(())
                    },
                ))
        }
    }

    #[test]
    fn test_unbound_read_strategy_is_a_decode_error() {
        let mapper = mapper_over(vec![0u8; 4]);
        // Builds fine: late binding defers resolution to decode time.
        assert!(schema_for::<Unread>(&mapper).is_ok());
        let err = decode_at::<Unread>(&mapper, 0).unwrap_err();
        assert!(matches!(err, DecodeError::MissingReadStrategy(ref f) if f == "value"));
    }

    #[derive(Debug, Default)]
    struct Unsized {
        value: u64,
    }

    impl StructMapped for Unsized {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Unsized")
                .construct_default()
                .field(FieldDecl::new("value").read(ReadStrategy::Scalar).assign(
                    |u: &mut Unsized, v| {
                        u.value = v.expect_u64("value")?;
                        Ok(())
                    },
                ))
        }
    }

    #[test]
    fn test_missing_length_is_a_decode_error() {
        let mapper = mapper_over(vec![0u8; 8]);
        let err = decode_at::<Unsized>(&mapper, 0).unwrap_err();
        assert!(matches!(err, DecodeError::MissingLength(ref f) if f == "value"));
    }

    #[derive(Debug, Default)]
    struct Tagged {
        name: String,
        kind: i8,
    }

    impl StructMapped for Tagged {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Tagged")
                .construct_default()
                .field(FieldDecl::new("name").read(ReadStrategy::CStr).assign(
                    |t: &mut Tagged, v| {
                        t.name = v.expect_str("name")?;
                        Ok(())
                    },
                ))
                .field(
                    FieldDecl::new("kind")
                        .signed()
                        .length(1)
                        .read(ReadStrategy::Scalar)
                        .assign(|t: &mut Tagged, v| {
                            t.kind = v.expect_i64("kind")? as i8;
                            Ok(())
                        }),
                )
                .after_decode(|t| {
                    if t.name.is_empty() {
                        return Err(DecodeError::Invalid("empty name".to_string()));
                    }
                    Ok(())
                })
        }
    }

    #[test]
    fn test_sequential_late_reads_and_hooks() {
        let mapper = mapper_over(b"abc\0\xFFtrailing".to_vec());
        let tagged: Tagged = decode_at(&mapper, 0).unwrap();
        assert_eq!(tagged.name, "abc");
        assert_eq!(tagged.kind, -1);
        assert_eq!(mapper.source().position(), 5);
    }

    #[test]
    fn test_failed_hook_aborts_decode() {
        let mapper = mapper_over(b"\0\0rest".to_vec());
        let err = decode_at::<Tagged>(&mapper, 0).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
    }

    #[derive(Default)]
    struct Doubled;

    impl StructMapped for Doubled {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Doubled")
                .construct_default()
                .field(
                    FieldDecl::new("a")
                        .length(2)
                        .read(ReadStrategy::Scalar)
                        .assign(|_, _| Ok(()))
                        .output(OutputDecl::new(1, OutputStrategy::Component)),
                )
                .field(
                    FieldDecl::new("b")
                        .length(2)
                        .read(ReadStrategy::Scalar)
                        .assign(|_, _| Ok(()))
                        .output(OutputDecl::new(1, OutputStrategy::Component)),
                )
        }
    }

    #[test]
    fn test_duplicate_ordinal_is_a_schema_error() {
        let mapper = mapper_over(vec![0u8; 4]);
        let err = schema_for::<Doubled>(&mapper).unwrap_err();
        assert_eq!(
            err,
            SchemaError::DuplicateOrdinal {
                ordinal: 1,
                field: "b".to_string(),
            }
        );
    }

    struct NoCtor;

    impl StructMapped for NoCtor {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("NoCtor")
        }
    }

    #[test]
    fn test_missing_constructor_is_a_schema_error() {
        let mapper = mapper_over(vec![0u8; 4]);
        assert!(matches!(
            schema_for::<NoCtor>(&mapper).unwrap_err(),
            SchemaError::NoConstructor(_)
        ));
    }

    #[derive(Default)]
    struct Inner {
        tag: u16,
    }

    impl StructMapped for Inner {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Inner")
                .construct_default()
                .field(FieldDecl::new("tag").read(ReadStrategy::Scalar).assign(
                    |i: &mut Inner, v| {
                        i.tag = v.expect_u64("tag")? as u16;
                        Ok(())
                    },
                ))
        }
    }

    #[derive(Default)]
    struct Outer {
        inner: Option<Inner>,
    }

    impl StructMapped for Outer {
        fn type_def() -> TypeDef<Self> {
            TypeDef::mapped("Outer")
                .construct_default()
                .field(
                    FieldDecl::new("inner")
                        .binding("nested")
                        .read(ReadStrategy::Custom(Box::new(
                            |fctx: &mut FieldDecodeContext<Outer>| {
                                let inner = fctx.read_nested::<Inner>()?;
                                Ok(Value::U64(inner.tag as u64))
                            },
                        )))
                        .assign(|o: &mut Outer, v| {
                            o.inner = Some(Inner {
                                tag: v.expect_u64("inner")? as u16,
                            });
                            Ok(())
                        }),
                )
        }
    }

    #[test]
    fn test_nested_decode() {
        let mapper = mapper_over(vec![0, 0, 0x34, 0x12]);
        mapper
            .register_layout("test", Layout::fixed("Inner", &[("tag", 2)]))
            .unwrap();
        mapper
            .register_layout("test", Layout::fixed("Outer", &[("pad", 2), ("nested", 2)]))
            .unwrap();

        let outer: Outer = decode_at(&mapper, 0).unwrap();
        assert_eq!(outer.inner.unwrap().tag, 0x1234);
    }
}
