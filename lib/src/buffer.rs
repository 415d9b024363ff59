//! In-memory queue of pending add/delete operations and the batching rules used to drain it.
//!
//! Appends go into a `Mutex<Vec<PendingUpdate>>`. A flush swaps that vector for an empty one
//! while holding the lock, then writes the captured updates with the lock released, so
//! appenders never wait on a slow backend.

use crate::errors::BufferClosed;
use crate::options::{UpdateFilter, UpdateKind};
use crate::session::{Session, TriplePattern};
use anyhow::{anyhow, Error, Result};
use log::{debug, info, warn};
use oxigraph::model::Triple;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// A buffered add or delete awaiting flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingUpdate {
    pub kind: UpdateKind,
    pub triple: Triple,
}

impl PendingUpdate {
    pub fn add(triple: Triple) -> Self {
        Self {
            kind: UpdateKind::Add,
            triple,
        }
    }

    pub fn delete(triple: Triple) -> Self {
        Self {
            kind: UpdateKind::Delete,
            triple,
        }
    }
}

/// Receives the updates of a flush that failed, so the caller can persist or retry them.
pub trait FlushErrorHandler: Send + Sync {
    /// `updates` is everything captured by the failed flush, including sub-batches the
    /// backend had already accepted.
    fn on_flush_error(&self, updates: &[PendingUpdate], error: &Error);
}

impl<F> FlushErrorHandler for F
where
    F: Fn(&[PendingUpdate], &Error) + Send + Sync,
{
    fn on_flush_error(&self, updates: &[PendingUpdate], error: &Error) {
        self(updates, error)
    }
}

pub struct UpdateBuffer {
    pending: Mutex<Vec<PendingUpdate>>,
    flush_batch_size: usize,
    error_handler: RwLock<Option<Arc<dyn FlushErrorHandler>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for UpdateBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UpdateBuffer")
            .field("len", &self.len())
            .field("flush_batch_size", &self.flush_batch_size)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl UpdateBuffer {
    pub fn new(flush_batch_size: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            flush_batch_size: flush_batch_size.max(1),
            error_handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn flush_batch_size(&self) -> usize {
        self.flush_batch_size
    }

    pub fn set_error_handler(&self, handler: Option<Arc<dyn FlushErrorHandler>>) {
        match self.error_handler.write() {
            Ok(mut slot) => *slot = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingUpdate>> {
        // a panicking appender cannot leave the vector half-written, so keep going
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn append<I>(&self, kind: UpdateKind, triples: I) -> Result<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        let mut pending = self.lock_pending();
        // checked under the lock, so nothing lands after close has drained the vector
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::new(BufferClosed));
        }
        pending.extend(triples.into_iter().map(|triple| PendingUpdate { kind, triple }));
        Ok(())
    }

    pub fn add<I>(&self, triples: I) -> Result<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.append(UpdateKind::Add, triples)
    }

    pub fn add_one(&self, triple: Triple) -> Result<()> {
        self.append(UpdateKind::Add, std::iter::once(triple))
    }

    pub fn delete<I>(&self, triples: I) -> Result<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.append(UpdateKind::Delete, triples)
    }

    pub fn delete_one(&self, triple: Triple) -> Result<()> {
        self.append(UpdateKind::Delete, std::iter::once(triple))
    }

    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes everything buffered so far to `session` and returns the number of updates
    /// drained. Updates appended while the flush runs stay buffered for the next one.
    ///
    /// Callers that flush from several threads must serialize calls themselves (the writer
    /// does this with its update-session mutex); otherwise two captured batches could reach
    /// the backend out of order.
    pub fn flush(&self, session: &mut dyn Session) -> Result<usize> {
        let captured = std::mem::take(&mut *self.lock_pending());
        if captured.is_empty() {
            return Ok(0);
        }
        debug!("Flushing {} buffered updates", captured.len());
        match write_batches(session, &captured, self.flush_batch_size) {
            Ok(calls) => {
                info!(
                    "Flushed {} updates in {} backend calls",
                    captured.len(),
                    calls
                );
                Ok(captured.len())
            }
            Err(err) => {
                let handler = match self.error_handler.read() {
                    Ok(slot) => slot.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                if let Some(handler) = handler {
                    handler.on_flush_error(&captured, &err);
                }
                Err(err.context(format!(
                    "Failed to flush {} buffered updates",
                    captured.len()
                )))
            }
        }
    }

    /// Returns the pending updates that match `pattern` and `filter`, in insertion order.
    pub fn find_buffered_updates(
        &self,
        pattern: &TriplePattern,
        filter: UpdateFilter,
    ) -> Vec<PendingUpdate> {
        self.lock_pending()
            .iter()
            .filter(|u| filter.accepts(u.kind) && pattern.matches(&u.triple))
            .cloned()
            .collect()
    }

    /// Drops every buffered update. Later appends fail and later flushes write nothing.
    pub fn close(&self) {
        let mut pending = self.lock_pending();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let dropped = std::mem::take(&mut *pending);
        drop(pending);
        if !dropped.is_empty() {
            warn!("Discarding {} unflushed updates on close", dropped.len());
        }
    }
}

/// Writes `updates` in insertion order, one backend call per run of same-kind updates, and
/// splits any run whose deduplicated set reaches `batch_size`. Returns the number of calls.
fn write_batches(
    session: &mut dyn Session,
    updates: &[PendingUpdate],
    batch_size: usize,
) -> Result<usize> {
    let mut calls = 0;
    let mut run_kind: Option<UpdateKind> = None;
    let mut run: HashSet<Triple> = HashSet::new();

    for update in updates {
        if run_kind != Some(update.kind) && !run.is_empty() {
            write_run(session, run_kind, &mut run)?;
            calls += 1;
        }
        run_kind = Some(update.kind);
        run.insert(update.triple.clone());
        if run.len() >= batch_size {
            write_run(session, run_kind, &mut run)?;
            calls += 1;
        }
    }
    if !run.is_empty() {
        write_run(session, run_kind, &mut run)?;
        calls += 1;
    }
    Ok(calls)
}

fn write_run(
    session: &mut dyn Session,
    kind: Option<UpdateKind>,
    run: &mut HashSet<Triple>,
) -> Result<()> {
    match kind {
        Some(UpdateKind::Add) => session.add(run)?,
        Some(UpdateKind::Delete) => session.delete(run)?,
        None => return Err(anyhow!("Update run has no kind")),
    }
    run.clear();
    Ok(())
}
