/*
    errors.rs - Error types for content resolvers
*/

use crate::core_value::OpId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    /// List operation references an insertion that is not known locally
    #[error("Dangling reference to {0}")]
    DanglingReference(OpId),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A single stream was requested but several sessions wrote to it
    #[error("Expected a single stream, found {0}")]
    MultipleStreams(usize),

    /// Handle kind does not match the value's header
    #[error("Value is a {actual}, not a {expected}")]
    WrongKind { expected: String, actual: String },

    #[error("Invalid change: {0}")]
    InvalidChange(String),
}

pub type ContentResult<T> = Result<T, ContentError>;
