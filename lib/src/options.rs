//! Shared option types that replace boolean flag parameters in the Rust API.

use serde::{Deserialize, Serialize};

/// Whether a write call should flush the buffer before returning.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum FlushMode {
    /// Flush the buffer to the backend before the call returns.
    Immediate,
    /// Leave the update buffered for the auto-flush loop.
    #[default]
    Deferred,
}

impl FlushMode {
    pub fn is_immediate(self) -> bool {
        matches!(self, FlushMode::Immediate)
    }
}

impl From<bool> for FlushMode {
    fn from(value: bool) -> Self {
        if value {
            FlushMode::Immediate
        } else {
            FlushMode::Deferred
        }
    }
}

impl From<FlushMode> for bool {
    fn from(value: FlushMode) -> Self {
        value.is_immediate()
    }
}

/// The kind of a buffered update.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    Add,
    Delete,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            UpdateKind::Add => write!(f, "add"),
            UpdateKind::Delete => write!(f, "delete"),
        }
    }
}

/// Selects which buffered updates a lookup returns.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum UpdateFilter {
    Add,
    Delete,
    #[default]
    Either,
}

impl UpdateFilter {
    pub fn accepts(self, kind: UpdateKind) -> bool {
        match self {
            UpdateFilter::Add => kind == UpdateKind::Add,
            UpdateFilter::Delete => kind == UpdateKind::Delete,
            UpdateFilter::Either => true,
        }
    }
}

impl From<UpdateKind> for UpdateFilter {
    fn from(value: UpdateKind) -> Self {
        match value {
            UpdateKind::Add => UpdateFilter::Add,
            UpdateKind::Delete => UpdateFilter::Delete,
        }
    }
}

/// Result shaping applied by the read side.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ReadOptions {
    /// Stop after this many rows.
    pub limit: Option<usize>,
    /// Suppress rows that were already returned.
    pub distinct: bool,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }
}
