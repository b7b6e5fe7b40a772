//! Annotation sessions: comments and cross references on a shared document.
//!
//! Markup is advisory enrichment layered on already-decoded data. Sessions
//! take `&mut self` so a pass applies its writes under a single writer.

use crate::errors::MarkupError;

/// Kind of comment placed at a document location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentKind {
    /// Banner comment above the structure.
    Plate,
    Pre,
    Post,
    Eol,
}

/// A mutable annotation document.
pub trait MarkupSession {
    /// Appends a comment of `kind` at `offset`.
    fn append_comment(
        &mut self,
        offset: u64,
        kind: CommentKind,
        text: &str,
    ) -> Result<(), MarkupError>;

    /// Establishes a cross reference between two document locations.
    fn add_reference(&mut self, from: u64, to: u64) -> Result<(), MarkupError>;
}

/// In-memory session collecting annotations, used by tests and as the
/// reference implementation.
#[derive(Debug, Default)]
pub struct MemorySession {
    pub comments: Vec<(u64, CommentKind, String)>,
    pub references: Vec<(u64, u64)>,
}

impl MemorySession {
    pub fn new() -> Self {
        MemorySession::default()
    }
}

impl MarkupSession for MemorySession {
    fn append_comment(
        &mut self,
        offset: u64,
        kind: CommentKind,
        text: &str,
    ) -> Result<(), MarkupError> {
        self.comments.push((offset, kind, text.to_string()));
        Ok(())
    }

    fn add_reference(&mut self, from: u64, to: u64) -> Result<(), MarkupError> {
        self.references.push((from, to));
        Ok(())
    }
}

/// Outcome of one markup pass. Failures are collected, never propagated.
#[derive(Debug, Default)]
pub struct MarkupReport {
    /// Number of strategy invocations attempted.
    pub attempted: usize,
    pub failures: Vec<MarkupFailure>,
}

impl MarkupReport {
    pub fn fully_applied(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One absorbed markup failure, named after the strategy that produced it.
#[derive(Debug)]
pub struct MarkupFailure {
    /// `Type.field` for field strategies, the type name for providers.
    pub source: String,
    pub error: MarkupError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_session_records() {
        let mut session = MemorySession::new();
        session.append_comment(4, CommentKind::Eol, "hello").unwrap();
        session.add_reference(4, 32).unwrap();
        assert_eq!(session.comments.len(), 1);
        assert_eq!(session.references, vec![(4, 32)]);
    }

    #[test]
    fn test_report_fully_applied() {
        let mut report = MarkupReport::default();
        assert!(report.fully_applied());
        report.failures.push(MarkupFailure {
            source: "T.f".to_string(),
            error: MarkupError::Failed("nope".to_string()),
        });
        assert!(!report.fully_applied());
    }
}
