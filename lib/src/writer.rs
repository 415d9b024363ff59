//! [`ConcurrentWriter`] buffers adds and deletes from many threads and writes them through one
//! dedicated update session, while reads go through a session pool.
//!
//! Buffered updates reach the backend when
//! - a caller asks for it (`FlushMode::Immediate` or [`ConcurrentWriter::flush_buffer`]),
//! - an append finds the buffer at its safe capacity (the appender flushes first),
//! - the background auto-flush thread sees the buffer idle for the dormant period or grown
//!   past the auto-flush size,
//! - the writer is closed.

use crate::buffer::{FlushErrorHandler, PendingUpdate, UpdateBuffer};
use crate::config::WriterConfig;
use crate::errors::WriterClosed;
use crate::options::{FlushMode, ReadOptions, UpdateFilter, UpdateKind};
use crate::pool::{GrowableSessionPool, PoolStats, SessionPool, SingleSessionPool};
use crate::reader::PooledReader;
use crate::session::{ResultIter, Session, SessionFactory, TripleIter, TriplePattern, TupleIter};
use crate::single_writer::{SessionLock, SingleWriterSession};
use anyhow::{Error, Result};
use log::{debug, error, info};
use oxigraph::model::Triple;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Draining,
    Closed,
}

struct WriterShared {
    config: WriterConfig,
    buffer: UpdateBuffer,
    last_activity: Mutex<Instant>,
    /// Held for the whole of a flush, so flushes never overlap.
    update_session: Mutex<Option<Box<dyn Session>>>,
    /// Set when reads and updates share one session. Its turn is taken before
    /// `update_session`, so a thread reading from it can still flush.
    single: Option<SingleWriterSession>,
    state: Mutex<WriterState>,
    wake: Condvar,
}

impl WriterShared {
    fn lock_state(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.lock_state() {
            WriterState::Open => Ok(()),
            _ => Err(Error::new(WriterClosed)),
        }
    }

    fn take_turn(&self) -> Result<Option<SessionLock>> {
        match &self.single {
            Some(single) => single.acquire().map(Some),
            None => Ok(None),
        }
    }

    fn flush(&self) -> Result<usize> {
        let turn = match self.take_turn() {
            Ok(turn) => turn,
            // close already drained the buffer before closing the shared session
            Err(_) if self.buffer.is_closed() => return Ok(0),
            Err(err) => return Err(err),
        };
        let flushed = {
            let mut slot = self
                .update_session
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match slot.as_mut() {
                Some(session) => self.buffer.flush(session.as_mut()),
                // taken by close, after its final flush
                None => Ok(0),
            }
        };
        if let Some(turn) = turn {
            turn.unlock();
        }
        flushed
    }

    fn should_auto_flush(&self) -> bool {
        let len = self.buffer.len();
        if len == 0 {
            return false;
        }
        if len >= self.config.auto_flush_size {
            return true;
        }
        let idle = self
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed();
        idle >= self.config.dormant_period()
    }

    fn auto_flush_loop(&self) {
        let mut state = self.lock_state();
        loop {
            if *state != WriterState::Open {
                return;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, self.config.poll_interval())
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if *state != WriterState::Open {
                return;
            }
            drop(state);
            if self.should_auto_flush() {
                if let Err(err) = self.flush() {
                    error!("Background flush failed: {err:#}");
                }
            }
            state = self.lock_state();
        }
    }
}

pub struct ConcurrentWriter {
    shared: Arc<WriterShared>,
    reader: PooledReader,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConcurrentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConcurrentWriter")
            .field("state", &*self.shared.lock_state())
            .field("buffered", &self.shared.buffer.len())
            .field("pool", &self.reader.pool().stats())
            .finish()
    }
}

impl ConcurrentWriter {
    /// Builds a growable read pool and one dedicated update session from `factory`.
    pub fn new(factory: Arc<dyn SessionFactory>, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(GrowableSessionPool::new(factory.clone(), &config)?);
        let update_session = match factory.new_session() {
            Ok(session) => session,
            Err(err) => {
                if let Err(close_err) = pool.close() {
                    error!("Failed to close session pool: {close_err:#}");
                }
                return Err(err.context("Failed to open the update session"));
            }
        };
        Self::with_parts(pool, update_session, config)
    }

    /// For backends with a single connection: reads and updates share `session` and take
    /// turns through a [`SingleWriterSession`].
    pub fn single(session: Box<dyn Session>, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let shared = SingleWriterSession::new(session, config.poll_interval());
        let pool = Arc::new(SingleSessionPool::new(shared.clone()));
        Self::build(pool, Box::new(shared.clone()), Some(shared), config)
    }

    pub fn with_parts(
        pool: Arc<dyn SessionPool>,
        update_session: Box<dyn Session>,
        config: WriterConfig,
    ) -> Result<Self> {
        Self::build(pool, update_session, None, config)
    }

    fn build(
        pool: Arc<dyn SessionPool>,
        update_session: Box<dyn Session>,
        single: Option<SingleWriterSession>,
        config: WriterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(WriterShared {
            buffer: UpdateBuffer::new(config.flush_batch_size),
            config,
            last_activity: Mutex::new(Instant::now()),
            update_session: Mutex::new(Some(update_session)),
            single,
            state: Mutex::new(WriterState::Open),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let spawned = std::thread::Builder::new()
            .name("rdfpool-autoflush".to_string())
            .spawn(move || worker.auto_flush_loop());
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                if let Some(mut session) = shared
                    .update_session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                {
                    if let Err(close_err) = session.close() {
                        error!("Failed to close update session: {close_err:#}");
                    }
                }
                if let Err(close_err) = pool.close() {
                    error!("Failed to close session pool: {close_err:#}");
                }
                return Err(Error::new(err).context("Failed to start the auto-flush thread"));
            }
        };
        debug!("Opened writer with {:?}", shared.config);
        Ok(Self {
            shared,
            reader: PooledReader::new(pool),
            flusher: Mutex::new(Some(handle)),
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.shared.config
    }

    fn append(&self, kind: UpdateKind, triples: Vec<Triple>, flush: FlushMode) -> Result<()> {
        self.shared.ensure_open()?;
        let shared = &self.shared;
        if shared.buffer.len() >= shared.config.buffer_safe_capacity {
            debug!(
                "Buffer reached its safe capacity of {}; flushing before append",
                shared.config.buffer_safe_capacity
            );
            shared.flush()?;
        }
        {
            // close cannot start draining between the open check and the append
            let state = shared.lock_state();
            if *state != WriterState::Open {
                return Err(Error::new(WriterClosed));
            }
            let mut last_activity = shared
                .last_activity
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            match kind {
                UpdateKind::Add => shared.buffer.add(triples)?,
                UpdateKind::Delete => shared.buffer.delete(triples)?,
            }
            *last_activity = Instant::now();
        }
        if flush.is_immediate() {
            shared.flush()?;
        } else if shared.buffer.len() >= shared.config.auto_flush_size {
            shared.wake.notify_all();
        }
        Ok(())
    }

    pub fn add<I>(&self, triples: I, flush: impl Into<FlushMode>) -> Result<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.append(UpdateKind::Add, triples.into_iter().collect(), flush.into())
    }

    pub fn add_one(&self, triple: Triple, flush: impl Into<FlushMode>) -> Result<()> {
        self.append(UpdateKind::Add, vec![triple], flush.into())
    }

    pub fn delete<I>(&self, triples: I, flush: impl Into<FlushMode>) -> Result<()>
    where
        I: IntoIterator<Item = Triple>,
    {
        self.append(UpdateKind::Delete, triples.into_iter().collect(), flush.into())
    }

    pub fn delete_one(&self, triple: Triple, flush: impl Into<FlushMode>) -> Result<()> {
        self.append(UpdateKind::Delete, vec![triple], flush.into())
    }

    /// Drains `source` in chunks of `auto_flush_size` and buffers each chunk as adds.
    /// `source` is closed afterwards, also on error. Returns the number of triples read.
    pub fn add_all<I>(&self, source: I, flush: impl Into<FlushMode>) -> Result<usize>
    where
        I: ResultIter<Triple>,
    {
        self.append_all(UpdateKind::Add, source, flush.into())
    }

    pub fn delete_all<I>(&self, source: I, flush: impl Into<FlushMode>) -> Result<usize>
    where
        I: ResultIter<Triple>,
    {
        self.append_all(UpdateKind::Delete, source, flush.into())
    }

    fn append_all<I>(&self, kind: UpdateKind, mut source: I, flush: FlushMode) -> Result<usize>
    where
        I: ResultIter<Triple>,
    {
        let drained = self.drain_chunks(kind, &mut source);
        let closed = source.close();
        let count = drained?;
        closed?;
        if flush.is_immediate() {
            self.shared.flush()?;
        }
        Ok(count)
    }

    fn drain_chunks<I>(&self, kind: UpdateKind, source: &mut I) -> Result<usize>
    where
        I: ResultIter<Triple>,
    {
        let chunk_size = self.shared.config.auto_flush_size;
        let mut chunk = Vec::with_capacity(chunk_size.min(4096));
        let mut count = 0;
        for triple in source {
            chunk.push(triple?);
            count += 1;
            if chunk.len() >= chunk_size {
                self.append(kind, std::mem::take(&mut chunk), FlushMode::Deferred)?;
            }
        }
        if !chunk.is_empty() {
            self.append(kind, chunk, FlushMode::Deferred)?;
        }
        Ok(count)
    }

    /// Writes everything buffered so far through the update session. Returns the number of
    /// updates written.
    pub fn flush_buffer(&self) -> Result<usize> {
        self.shared.ensure_open()?;
        self.shared.flush()
    }

    /// Called with the whole captured batch whenever a flush fails, including background ones.
    pub fn set_flush_error_handler(&self, handler: Arc<dyn FlushErrorHandler>) {
        self.shared.buffer.set_error_handler(Some(handler));
    }

    pub fn clear_flush_error_handler(&self) {
        self.shared.buffer.set_error_handler(None);
    }

    pub fn buffer_len(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn find_buffered_updates(
        &self,
        pattern: &TriplePattern,
        filter: UpdateFilter,
    ) -> Result<Vec<PendingUpdate>> {
        self.shared.ensure_open()?;
        Ok(self.shared.buffer.find_buffered_updates(pattern, filter))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.reader.pool().stats()
    }

    pub fn reader(&self) -> &PooledReader {
        &self.reader
    }

    pub fn supported_query_languages(&self) -> Vec<String> {
        self.reader.supported_query_languages()
    }

    pub fn find_tuples(&self, language: &str, text: &str, options: ReadOptions) -> Result<TupleIter> {
        self.shared.ensure_open()?;
        self.reader.find_tuples(language, text, options)
    }

    pub fn find_triples(&self, pattern: &TriplePattern, options: ReadOptions) -> Result<TripleIter> {
        self.shared.ensure_open()?;
        self.reader.find_triples(pattern, options)
    }

    pub fn construct_triples(
        &self,
        language: &str,
        text: &str,
        options: ReadOptions,
    ) -> Result<TripleIter> {
        self.shared.ensure_open()?;
        self.reader.construct_triples(language, text, options)
    }

    pub fn count_tuples(&self, language: &str, text: &str, options: ReadOptions) -> Result<usize> {
        self.shared.ensure_open()?;
        self.reader.count_tuples(language, text, options)
    }

    pub fn count_triples(&self, pattern: &TriplePattern, options: ReadOptions) -> Result<usize> {
        self.shared.ensure_open()?;
        self.reader.count_triples(pattern, options)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.lock_state() != WriterState::Open
    }

    /// Stops the auto-flush thread, makes a last attempt to flush, then closes the buffer, the
    /// update session and the read pool. Failures along the way are logged. Calling it again
    /// does nothing.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.lock_state();
            if *state != WriterState::Open {
                return Ok(());
            }
            *state = WriterState::Draining;
        }
        self.shared.wake.notify_all();
        let handle = self
            .flusher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Auto-flush thread panicked");
            }
        }

        match self.shared.flush() {
            Ok(0) => {}
            Ok(n) => debug!("Flushed {} updates on close", n),
            Err(err) => error!("Final flush on close failed: {err:#}"),
        }
        self.shared.buffer.close();

        let update_session = self
            .shared
            .update_session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut session) = update_session {
            if let Err(err) = session.close() {
                error!("Failed to close update session: {err:#}");
            }
        }
        if let Err(err) = self.reader.pool().close() {
            error!("Failed to close session pool: {err:#}");
        }

        *self.shared.lock_state() = WriterState::Closed;
        info!("Closed writer");
        Ok(())
    }
}

impl Drop for ConcurrentWriter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("Failed to close writer on drop: {err:#}");
        }
    }
}
