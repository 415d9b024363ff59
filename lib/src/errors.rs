//! Error conditions callers may want to detect with `anyhow::Error::downcast_ref`.

use std::fmt;

/// The pool has no free session and is not allowed to grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoSessionAvailable {
    pub max: Option<usize>,
}

impl fmt::Display for NoSessionAvailable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "No session available (pool is at its maximum of {})", max),
            None => write!(f, "No session available"),
        }
    }
}

impl std::error::Error for NoSessionAvailable {}

/// A single-writer session is closing (or closed) and accepts no new callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosing;

impl fmt::Display for SessionClosing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Session is closing; no further operations are accepted")
    }
}

impl std::error::Error for SessionClosing {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterClosed;

impl fmt::Display for WriterClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Writer has been closed")
    }
}

impl std::error::Error for WriterClosed {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferClosed;

impl fmt::Display for BufferClosed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Update buffer has been closed")
    }
}

impl std::error::Error for BufferClosed {}

/// The backend behind a session cannot perform the requested operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedOperation {
    pub operation: String,
}

impl UnsupportedOperation {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
        }
    }
}

impl fmt::Display for UnsupportedOperation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Unsupported operation: {}", self.operation)
    }
}

impl std::error::Error for UnsupportedOperation {}
