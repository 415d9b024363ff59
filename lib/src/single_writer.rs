//! Serialized access to a backend that offers exactly one usable connection.
//!
//! Callers queue up in arrival order and take turns. Handles are cheap clones that share
//! the queue and the wrapped session, so each thread works with its own handle.

use crate::errors::SessionClosing;
use crate::iter::{Releasable, ReleasingIter};
use crate::session::{Session, TripleIter, TriplePattern, TupleIter};
use anyhow::{Error, Result};
use log::{debug, warn};
use oxigraph::model::Triple;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

struct LockQueue {
    waiting: VecDeque<ThreadId>,
    /// Nested acquisitions by the thread at the front of `waiting`.
    holds: usize,
    closing: bool,
}

struct Shared {
    queue: Mutex<LockQueue>,
    turn: Condvar,
    session: Mutex<Option<Box<dyn Session>>>,
    languages: Vec<String>,
    poll_interval: Duration,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, LockQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn unlock(&self, owner: ThreadId) {
        let mut queue = self.lock_queue();
        if queue.waiting.front() == Some(&owner) && queue.holds > 0 {
            queue.holds -= 1;
            if queue.holds == 0 {
                queue.waiting.pop_front();
                self.turn.notify_all();
            }
        } else {
            warn!(
                "Thread {:?} released a session lock it does not hold; ignoring",
                owner
            );
        }
    }
}

/// Exclusive right to use the wrapped session. Released by [`SessionLock::unlock`] or on drop.
pub struct SessionLock {
    shared: Arc<Shared>,
    owner: ThreadId,
    released: bool,
}

impl SessionLock {
    pub fn unlock(mut self) {
        self.released = true;
        self.shared.unlock(self.owner);
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.unlock(self.owner);
        }
    }
}

impl Releasable for SessionLock {
    fn release(self) {
        self.unlock();
    }
}

/// A [`Session`] wrapper that lets many threads share one non-thread-safe session.
///
/// Each operation takes the lock, calls the wrapped session and releases the lock. Query and
/// find results keep the lock until the returned iterator is closed, exhausted or dropped,
/// because the backend may still be streaming rows.
///
/// The lock is keyed by thread and reentrant: a thread that already holds it gets it again at
/// once, and its turn ends only when every lock it took has been released.
#[derive(Clone)]
pub struct SingleWriterSession {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SingleWriterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let queue = self.shared.lock_queue();
        f.debug_struct("SingleWriterSession")
            .field("waiting", &queue.waiting.len())
            .field("closing", &queue.closing)
            .finish()
    }
}

impl SingleWriterSession {
    pub fn new(session: Box<dyn Session>, poll_interval: Duration) -> Self {
        let languages = session.supported_query_languages();
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(LockQueue {
                    waiting: VecDeque::new(),
                    holds: 0,
                    closing: false,
                }),
                turn: Condvar::new(),
                session: Mutex::new(Some(session)),
                languages,
                poll_interval,
            }),
        }
    }

    /// Waits for this thread's turn. Fails at once if the session is closing.
    pub fn acquire(&self) -> Result<SessionLock> {
        self.acquire_inner(false)
    }

    fn acquire_inner(&self, for_close: bool) -> Result<SessionLock> {
        let me = thread::current().id();
        let mut queue = self.shared.lock_queue();
        if queue.closing && !for_close {
            return Err(Error::new(SessionClosing));
        }
        if for_close {
            queue.closing = true;
        }
        if queue.waiting.front() == Some(&me) {
            queue.holds += 1;
        } else {
            queue.waiting.push_back(me);
            while queue.waiting.front() != Some(&me) {
                let (guard, _) = self
                    .shared
                    .turn
                    .wait_timeout(queue, self.shared.poll_interval)
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
            }
            queue.holds = 1;
        }
        Ok(SessionLock {
            shared: self.shared.clone(),
            owner: me,
            released: false,
        })
    }

    /// Number of threads queued, including the current holder.
    pub fn waiting(&self) -> usize {
        self.shared.lock_queue().waiting.len()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.lock_queue().closing
    }

    fn call<T>(&self, f: impl FnOnce(&mut dyn Session) -> Result<T>) -> Result<T> {
        let mut slot = self
            .shared
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let session = slot.as_mut().ok_or_else(|| Error::new(SessionClosing))?;
        f(session.as_mut())
    }

    fn locked<T>(&self, f: impl FnOnce(&mut dyn Session) -> Result<T>) -> Result<T> {
        let lock = self.acquire()?;
        let res = self.call(f);
        lock.unlock();
        res
    }

    fn locked_triples(
        &self,
        f: impl FnOnce(&mut dyn Session) -> Result<TripleIter>,
    ) -> Result<TripleIter> {
        let lock = self.acquire()?;
        // on error the lock is dropped, and therefore released, before we return
        let triples = self.call(f)?;
        Ok(Box::new(ReleasingIter::new(triples, lock)))
    }
}

impl Session for SingleWriterSession {
    fn add(&mut self, triples: &HashSet<Triple>) -> Result<()> {
        self.locked(|session| session.add(triples))
    }

    fn delete(&mut self, triples: &HashSet<Triple>) -> Result<()> {
        self.locked(|session| session.delete(triples))
    }

    fn query(&mut self, language: &str, text: &str) -> Result<TupleIter> {
        let lock = self.acquire()?;
        let rows = self.call(|session| session.query(language, text))?;
        Ok(Box::new(ReleasingIter::new(rows, lock)))
    }

    fn find_triples(&mut self, pattern: &TriplePattern) -> Result<TripleIter> {
        self.locked_triples(|session| session.find_triples(pattern))
    }

    fn construct(&mut self, language: &str, text: &str) -> Result<TripleIter> {
        self.locked_triples(|session| session.construct(language, text))
    }

    fn supported_query_languages(&self) -> Vec<String> {
        self.shared.languages.clone()
    }

    /// Waits behind every queued caller, then closes the wrapped session. New callers are
    /// rejected from the moment this is called.
    fn close(&mut self) -> Result<()> {
        let lock = self.acquire_inner(true)?;
        let session = self
            .shared
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let res = match session {
            Some(mut session) => {
                debug!("Closing single-writer session");
                session.close()
            }
            None => Ok(()),
        };
        lock.unlock();
        res
    }
}
