//! Session pools: the read side of a writer borrows sessions here.
//!
//! [`GrowableSessionPool`] keeps free and leased sessions apart, creates sessions on demand up
//! to a bound, and runs a maintenance thread that keeps a few idle spares ready.
//! [`SingleSessionPool`] is the degenerate variant for backends that only offer one
//! connection: every lease is a handle onto the same [`SingleWriterSession`].

use crate::config::WriterConfig;
use crate::iter::Releasable;
use crate::session::{Session, SessionFactory};
use crate::single_writer::SingleWriterSession;
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

pub type SessionId = u64;

/// Snapshot of a pool's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub free: usize,
    pub in_use: usize,
    /// Live sessions owned by the pool, free or leased.
    pub created: usize,
}

/// Where a lease goes back to when it is released.
trait SessionHome: Send + Sync {
    fn take_back(&self, id: SessionId, session: Box<dyn Session>);
}

/// A session leased from a pool. Dropping it hands the session back.
pub struct PooledSession {
    id: SessionId,
    session: Option<Box<dyn Session>>,
    home: Option<Weak<dyn SessionHome>>,
}

impl PooledSession {
    fn homed(id: SessionId, session: Box<dyn Session>, home: Weak<dyn SessionHome>) -> Self {
        Self {
            id,
            session: Some(session),
            home: Some(home),
        }
    }

    fn unhomed(id: SessionId, session: Box<dyn Session>) -> Self {
        Self {
            id,
            session: Some(session),
            home: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    fn belongs_to(&self, home: *const ()) -> bool {
        match &self.home {
            Some(weak) => std::ptr::eq(weak.as_ptr() as *const (), home),
            None => false,
        }
    }
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PooledSession").field("id", &self.id).finish()
    }
}

impl Deref for PooledSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("session is present until the lease is dropped")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("session is present until the lease is dropped")
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let Some(home) = self.home.as_ref() else {
            return;
        };
        match home.upgrade() {
            Some(home) => home.take_back(self.id, session),
            None => {
                debug!("Pool for session {} is gone; closing it", self.id);
                if let Err(err) = session.close() {
                    error!("Failed to close orphaned session {}: {err:#}", self.id);
                }
            }
        }
    }
}

impl Releasable for PooledSession {
    fn release(self) {
        drop(self);
    }
}

/// Lends sessions out to readers.
pub trait SessionPool: Send + Sync {
    /// Leases a session, or returns `Ok(None)` when none is free and the pool may not grow.
    fn get(&self) -> Result<Option<PooledSession>>;

    /// Returns a lease. A lease from another pool is ignored with a warning (and goes back to
    /// its own pool when dropped).
    fn release(&self, session: PooledSession);

    fn stats(&self) -> PoolStats;

    /// Upper bound on the number of sessions, if any.
    fn max_size(&self) -> Option<usize>;

    fn supported_query_languages(&self) -> Vec<String>;

    /// Closes every session and the factory. Failures are logged, not returned.
    fn close(&self) -> Result<()>;
}

struct PoolState {
    free: Vec<(SessionId, Box<dyn Session>)>,
    in_use: HashSet<SessionId>,
    /// Slots reserved for sessions being created outside the lock.
    creating: usize,
    closed: bool,
}

impl PoolState {
    fn live(&self) -> usize {
        self.free.len() + self.in_use.len()
    }

    fn has_room(&self, max: Option<usize>) -> bool {
        max.map_or(true, |max| self.live() + self.creating < max)
    }
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    state: Mutex<PoolState>,
    wake: Condvar,
    max_size: Option<usize>,
    spare_target: usize,
    poll_interval: Duration,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn close_session(id: SessionId, mut session: Box<dyn Session>) {
        if let Err(err) = session.close() {
            error!("Failed to close session {}: {err:#}", id);
        }
    }

    /// Creates `count` sessions outside the lock and adds them to the free list. The caller
    /// must already have reserved them in `creating`.
    fn grow(&self, count: usize) -> Result<()> {
        let mut result = Ok(());
        for created in 0..count {
            match self.factory.new_session() {
                Ok(session) => {
                    let id = self.next_id();
                    let mut state = self.lock_state();
                    state.creating -= 1;
                    if state.closed {
                        drop(state);
                        Self::close_session(id, session);
                    } else {
                        state.free.push((id, session));
                    }
                }
                Err(err) => {
                    // release the reservations that will not be filled
                    let mut state = self.lock_state();
                    state.creating -= count - created;
                    result = Err(err);
                    break;
                }
            }
        }
        result
    }

    fn maintain(&self) {
        let mut state = self.lock_state();
        loop {
            if state.closed {
                return;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(state, self.poll_interval)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if state.closed {
                return;
            }
            let mut wanted = self
                .spare_target
                .saturating_sub(state.free.len() + state.creating);
            if let Some(max) = self.max_size {
                wanted = wanted.min(max.saturating_sub(state.live() + state.creating));
            }
            if wanted == 0 {
                continue;
            }
            state.creating += wanted;
            drop(state);
            info!("Growing session pool by {} spare session(s)", wanted);
            if let Err(err) = self.grow(wanted) {
                error!("Failed to grow session pool: {err:#}");
            }
            state = self.lock_state();
        }
    }
}

impl SessionHome for PoolInner {
    fn take_back(&self, id: SessionId, session: Box<dyn Session>) {
        let mut state = self.lock_state();
        if !state.in_use.remove(&id) {
            drop(state);
            warn!("Session {} was not leased from this pool; closing it", id);
            Self::close_session(id, session);
            return;
        }
        if state.closed {
            drop(state);
            debug!("Session {} returned after pool close; closing it", id);
            Self::close_session(id, session);
            return;
        }
        state.free.push((id, session));
    }
}

pub struct GrowableSessionPool {
    inner: Arc<PoolInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for GrowableSessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GrowableSessionPool")
            .field("stats", &self.stats())
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl GrowableSessionPool {
    /// Opens `config.pool_initial_size` sessions up front. The maintenance thread is only
    /// started when the pool is allowed to grow past that.
    pub fn new(factory: Arc<dyn SessionFactory>, config: &WriterConfig) -> Result<Self> {
        let initial = config.pool_initial_size;
        let max_size = config.pool_max_size();
        let inner = Arc::new(PoolInner {
            factory,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(initial),
                in_use: HashSet::new(),
                creating: initial,
                closed: false,
            }),
            wake: Condvar::new(),
            max_size,
            spare_target: config.pool_spare_sessions,
            poll_interval: config.poll_interval(),
            next_id: AtomicU64::new(1),
        });
        if let Err(err) = inner.grow(initial) {
            let mut state = inner.lock_state();
            state.closed = true;
            let free = std::mem::take(&mut state.free);
            drop(state);
            for (id, session) in free {
                PoolInner::close_session(id, session);
            }
            return Err(err.context("Failed to open the initial pool sessions"));
        }

        let growable = max_size.map_or(true, |max| max > initial);
        let maintenance = if growable {
            let worker = inner.clone();
            let handle = std::thread::Builder::new()
                .name("rdfpool-maintenance".to_string())
                .spawn(move || worker.maintain())?;
            Some(handle)
        } else {
            None
        };
        debug!(
            "Created session pool with {} session(s), max {:?}",
            initial, max_size
        );
        Ok(Self {
            inner,
            maintenance: Mutex::new(maintenance),
            closed: AtomicBool::new(false),
        })
    }

    fn home(&self) -> Weak<dyn SessionHome> {
        let inner: Arc<dyn SessionHome> = self.inner.clone();
        Arc::downgrade(&inner)
    }
}

impl SessionPool for GrowableSessionPool {
    fn get(&self) -> Result<Option<PooledSession>> {
        let mut state = self.inner.lock_state();
        if state.closed {
            return Err(anyhow!("Session pool is closed"));
        }
        if let Some((id, session)) = state.free.pop() {
            state.in_use.insert(id);
            return Ok(Some(PooledSession::homed(id, session, self.home())));
        }
        if !state.has_room(self.inner.max_size) {
            return Ok(None);
        }
        // create synchronously, without holding the lock
        state.creating += 1;
        drop(state);
        debug!("No free session; creating one on demand");
        let created = self.inner.factory.new_session();
        let id = self.inner.next_id();
        let mut state = self.inner.lock_state();
        state.creating -= 1;
        let session = created?;
        if state.closed {
            drop(state);
            PoolInner::close_session(id, session);
            return Err(anyhow!("Session pool is closed"));
        }
        state.in_use.insert(id);
        Ok(Some(PooledSession::homed(id, session, self.home())))
    }

    fn release(&self, session: PooledSession) {
        let ours = Arc::as_ptr(&self.inner) as *const ();
        if !session.belongs_to(ours) {
            warn!(
                "Session {} was not leased from this pool; ignoring release",
                session.id()
            );
        }
        drop(session);
    }

    fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            free: state.free.len(),
            in_use: state.in_use.len(),
            created: state.live(),
        }
    }

    fn max_size(&self) -> Option<usize> {
        self.inner.max_size
    }

    fn supported_query_languages(&self) -> Vec<String> {
        self.inner.factory.supported_query_languages()
    }

    /// Leased sessions cannot be reached from here; each one is closed when its lease comes
    /// back, even after the factory has been closed.
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (free, leased) = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            (std::mem::take(&mut state.free), state.in_use.len())
        };
        if leased > 0 {
            warn!(
                "Closing session pool with {} session(s) still leased; they close on return",
                leased
            );
        }
        self.inner.wake.notify_all();
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Session pool maintenance thread panicked");
            }
        }
        let count = free.len();
        for (id, session) in free {
            PoolInner::close_session(id, session);
        }
        if let Err(err) = self.inner.factory.close() {
            error!("Failed to close session factory: {err:#}");
        }
        info!("Closed session pool ({} idle session(s) closed)", count);
        Ok(())
    }
}

impl Drop for GrowableSessionPool {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("Failed to close session pool on drop: {err:#}");
        }
    }
}

/// A pool over one shared session. `get()` always succeeds while open; `release()` is a no-op.
pub struct SingleSessionPool {
    session: SingleWriterSession,
    factory: Option<Arc<dyn SessionFactory>>,
    closed: AtomicBool,
}

impl SingleSessionPool {
    pub fn new(session: SingleWriterSession) -> Self {
        Self {
            session,
            factory: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Opens the factory's one session and wraps it for serialized access.
    pub fn from_factory(factory: Arc<dyn SessionFactory>, poll_interval: Duration) -> Result<Self> {
        let session = SingleWriterSession::new(factory.new_session()?, poll_interval);
        Ok(Self {
            session,
            factory: Some(factory),
            closed: AtomicBool::new(false),
        })
    }

    /// Another handle onto the shared session, e.g. to use it for updates.
    pub fn session(&self) -> SingleWriterSession {
        self.session.clone()
    }
}

impl SessionPool for SingleSessionPool {
    fn get(&self) -> Result<Option<PooledSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("Session pool is closed"));
        }
        Ok(Some(PooledSession::unhomed(0, Box::new(self.session.clone()))))
    }

    fn release(&self, session: PooledSession) {
        drop(session);
    }

    fn stats(&self) -> PoolStats {
        if self.closed.load(Ordering::SeqCst) {
            return PoolStats::default();
        }
        PoolStats {
            free: 1,
            in_use: 0,
            created: 1,
        }
    }

    fn max_size(&self) -> Option<usize> {
        Some(1)
    }

    fn supported_query_languages(&self) -> Vec<String> {
        self.session.supported_query_languages()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut session = self.session.clone();
        if let Err(err) = session.close() {
            error!("Failed to close shared session: {err:#}");
        }
        if let Some(factory) = &self.factory {
            if let Err(err) = factory.close() {
                error!("Failed to close session factory: {err:#}");
            }
        }
        Ok(())
    }
}
