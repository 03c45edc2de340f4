//! Engine Error Types

use thiserror::Error;

/// Errors surfaced by the iterator engine.
///
/// Progress outcomes are not errors: suspension (`More`) and end-of-sequence
/// (`Done`) travel through the [`crate::budget::Step`] family of result
/// enums. This enum only carries conditions that abort or reject a request.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An id or GUID the request named does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An id fell outside the iterator's [low, high) window
    #[error("id {id} outside [{low}, {high})")]
    OutOfRange { id: u64, low: u64, high: u64 },

    /// Malformed cursor token stream
    #[error("cursor lexical error at byte {at}: {what}")]
    Lexical { at: usize, what: String },

    /// Cursor tokens scanned but do not form a valid iterator
    #[error("cursor syntax error: {0}")]
    Syntax(String),

    /// Request exceeded its hard cost cap
    #[error("request too hard: spent {spent} cost units (cap {cap})")]
    TooHard { spent: i64, cap: i64 },

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
