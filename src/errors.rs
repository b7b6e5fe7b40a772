//! Error types for schema building, decoding, layout synthesis and markup.
//!
//! The categories are strictly separated: schema and decode failures are fatal
//! to their operation and never retried, synthesis failures spoil only the
//! synthesis call, and markup failures are absorbed by the markup pass.

use thiserror::Error;

/// Errors produced when reading from a [`crate::source::ByteSource`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Requested byte range is beyond the end of the source.
    #[error("read of {len} bytes at offset {offset} is out of bounds (source is {source_len} bytes)")]
    OutOfBounds {
        offset: u64,
        len: usize,
        source_len: u64,
    },
    /// Integer reads support 1 to 8 bytes.
    #[error("unsupported integer width of {0} bytes")]
    UnsupportedWidth(usize),
    /// No NUL terminator before the end of the source.
    #[error("unterminated string at offset {offset}")]
    UnterminatedString { offset: u64 },
    /// String bytes are not valid UTF-8.
    #[error("invalid utf-8 in string at offset {offset}")]
    InvalidUtf8 { offset: u64 },
}

/// Fatal errors raised while building a [`crate::schema::TypeSchema`].
///
/// A failed build aborts registration of that type and is never published to
/// the schema cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// A mapped field names a component that the fixed layout does not define.
    #[error("missing layout component `{field}` in layout `{layout}`")]
    MissingBinding { field: String, layout: String },
    /// Two output declarations share an ordinal.
    #[error("duplicate output ordinal {ordinal} on field `{field}`")]
    DuplicateOrdinal { ordinal: u32, field: String },
    /// Neither a with-context nor a default constructor was registered.
    #[error("no construction strategy registered for `{0}`")]
    NoConstructor(&'static str),
    /// A mapped field has no assignment target.
    #[error("field `{0}` has no assignment target")]
    MissingSetter(String),
}

/// Fatal to the single decode in progress.
///
/// The partially populated instance is discarded; callers must treat the
/// whole decode as invalid rather than retry per field.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Late binding deferred resolution to decode time and found nothing.
    #[error("no read strategy bound for field `{0}`")]
    MissingReadStrategy(String),
    /// A late-bound name has no component in the available layout.
    #[error("field `{field}` cannot be resolved against layout `{layout}`")]
    UnresolvedField { field: String, layout: String },
    /// The field's strategy needs a length and none can be derived.
    #[error("missing length for field `{0}`")]
    MissingLength(String),
    /// A context field declares a type that is neither the environment nor
    /// the decode context.
    #[error("unsupported context field `{field}` of type {declared}")]
    UnsupportedContextField {
        field: String,
        declared: &'static str,
    },
    /// A read strategy produced a value the field setter cannot accept.
    #[error("value of kind {got} cannot populate field `{field}`")]
    ValueMismatch { field: String, got: &'static str },
    /// Failure reported by a post-decode hook or a custom strategy.
    #[error("{0}")]
    Invalid(String),
}

/// Fatal to a single layout synthesis call.
///
/// The already-decoded instance stays valid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    /// Synthesis applies to variable-length types only.
    #[error("type `{0}` has a fixed layout")]
    FixedLayout(&'static str),
    /// Synthesized layout names allow ASCII alphanumerics and underscores.
    #[error("invalid layout name `{0}`")]
    InvalidName(String),
    /// An output strategy could not append its field.
    #[error("output strategy failed on field `{field}`: {reason}")]
    OutputFailed { field: String, reason: String },
    /// The name is already registered with a different definition.
    #[error("layout `{0}` is already registered with a different definition")]
    NameCollision(String),
}

/// Advisory markup failures.
///
/// Caught and logged per strategy invocation; never aborts the pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    #[error("comment rejected at offset {offset}")]
    CommentRejected { offset: u64 },
    #[error("reference rejected from {from} to {to}")]
    ReferenceRejected { from: u64, to: u64 },
    #[error("{0}")]
    Failed(String),
}
