//! Pluggable strategies: how fields are read from the byte source, emitted
//! into synthesized layouts, and annotated onto the shared document.
//!
//! Each strategy is a tagged variant dispatching to built-in behavior or to a
//! function value attached at registration time.

use crate::context::{ContextHandle, FieldDecodeContext};
use crate::errors::{DecodeError, MarkupError, SynthesisError};
use crate::layout::LayoutBuilder;
use crate::markup::{CommentKind, MarkupSession};
use crate::value::Value;

pub type ReadFn<T> =
    Box<dyn Fn(&mut FieldDecodeContext<'_, T>) -> Result<Value, DecodeError> + Send + Sync>;

/// Produces a field's [`Value`] from the byte source.
pub enum ReadStrategy<T> {
    /// Integer of the field's bound or explicit length; the descriptor's
    /// signedness selects sign extension.
    Scalar,
    /// Raw bytes of the field's bound or explicit length.
    FixedBytes,
    /// Null-terminated string. Self-sizing: consumed length is bytes + 1.
    CStr,
    Custom(ReadFn<T>),
}

pub type OutputFn<T> = Box<dyn Fn(&T, &mut LayoutBuilder) -> Result<(), SynthesisError> + Send + Sync>;

/// Appends one field's representation to a [`LayoutBuilder`] during synthesis.
pub enum OutputStrategy<T> {
    /// Appends a component named after the field's binding with its declared
    /// length, honoring an explicit target offset when one is set.
    Component,
    /// Appends whatever the function decides, typically sized from the
    /// decoded instance (variable-length fields).
    Custom(OutputFn<T>),
}

pub type MarkupFn<T> =
    Box<dyn Fn(&T, &ContextHandle, &mut dyn MarkupSession) -> Result<(), MarkupError> + Send + Sync>;

/// Annotates the shared document from one decoded field.
pub enum MarkupStrategy<T> {
    /// Appends a comment of `kind` at the field's location. A `None` render
    /// result skips the comment.
    Comment {
        kind: CommentKind,
        render: Box<dyn Fn(&T) -> Option<String> + Send + Sync>,
    },
    /// Establishes a cross reference from the field's location to the target
    /// offset. A `None` target skips the reference.
    Reference {
        target: Box<dyn Fn(&T) -> Option<u64> + Send + Sync>,
    },
    Custom(MarkupFn<T>),
}

impl<T> MarkupStrategy<T> {
    /// Comment at the field's location.
    pub fn comment(
        kind: CommentKind,
        render: impl Fn(&T) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        MarkupStrategy::Comment {
            kind,
            render: Box::new(render),
        }
    }

    /// Cross reference from the field's location.
    pub fn reference(target: impl Fn(&T) -> Option<u64> + Send + Sync + 'static) -> Self {
        MarkupStrategy::Reference {
            target: Box::new(target),
        }
    }

    pub fn custom(
        run: impl Fn(&T, &ContextHandle, &mut dyn MarkupSession) -> Result<(), MarkupError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        MarkupStrategy::Custom(Box::new(run))
    }
}

/// Type-level markup attached to the whole structure.
pub enum MarkupProvider<T> {
    /// Appends a plate comment at the structure start.
    PlateComment(Box<dyn Fn(&T) -> Option<String> + Send + Sync>),
    Custom(MarkupFn<T>),
}
