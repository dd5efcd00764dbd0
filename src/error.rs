use std::fmt;

/// The error kinds that can occur anywhere in the runtime.
///
/// Matches the error-kind taxonomy used across the runtime: a small, flat
/// enum rather than a tree of nested error types, so that callers at the
/// script/message boundary can match on a kind without downcasting.
#[derive(Debug, Clone, PartialEq)]
pub enum TasError {
    InvalidArgument(String),
    NotInitialized(String),
    InvalidTransition { from: String, event: String },
    QueueFull,
    MessageTooLarge { size: usize, max: usize },
    SerializationRejected(String),
    ScriptLoadFailure(String),
    ScriptRuntime(String),
    RecordCorrupt(String),
    RecordDecompressFailure(String),
    MemoryLimitExceeded { context: String, used: usize, limit: usize },
    RequestTimeout,
    OwnerThreadViolation { context: String },
}

impl fmt::Display for TasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TasError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            TasError::NotInitialized(what) => write!(f, "not initialized: {what}"),
            TasError::InvalidTransition { from, event } => {
                write!(f, "invalid transition: {event} is not valid from {from}")
            }
            TasError::QueueFull => write!(f, "queue full"),
            TasError::MessageTooLarge { size, max } => {
                write!(f, "message too large: {size} bytes exceeds limit of {max} bytes")
            }
            TasError::SerializationRejected(msg) => write!(f, "serialization rejected: {msg}"),
            TasError::ScriptLoadFailure(msg) => write!(f, "script load failure: {msg}"),
            TasError::ScriptRuntime(msg) => write!(f, "script runtime error: {msg}"),
            TasError::RecordCorrupt(msg) => write!(f, "record corrupt: {msg}"),
            TasError::RecordDecompressFailure(msg) => write!(f, "record decompression failed: {msg}"),
            TasError::MemoryLimitExceeded { context, used, limit } => write!(
                f,
                "context '{context}' exceeded memory limit: {used} bytes used, limit {limit} bytes"
            ),
            TasError::RequestTimeout => write!(f, "request timed out"),
            TasError::OwnerThreadViolation { context } => {
                write!(f, "context '{context}' accessed from a thread other than its owner")
            }
        }
    }
}

impl std::error::Error for TasError {}

pub type TasResult<T> = Result<T, TasError>;
