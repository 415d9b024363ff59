#![allow(dead_code)]

use anyhow::{anyhow, Error, Result};
use oxigraph::model::{NamedNode, Triple};
use rdfpool::errors::UnsupportedOperation;
use rdfpool::session::{
    ResultIter, Session, SessionFactory, TripleIter, TriplePattern, Tuple, TupleIter,
    VecResultIter,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const MOCK_LANGUAGE: &str = "mock";

/// One backend call, as seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Add(HashSet<Triple>),
    Delete(HashSet<Triple>),
    Query(String),
    FindTriples,
    Construct(String),
}

impl Call {
    pub fn write_size(&self) -> Option<usize> {
        match self {
            Call::Add(set) | Call::Delete(set) => Some(set.len()),
            _ => None,
        }
    }
}

/// State shared by every session a [`MockFactory`] hands out: a set of triples plus a log of
/// each backend call.
#[derive(Default)]
pub struct MockBackend {
    triples: Mutex<HashSet<Triple>>,
    calls: Mutex<Vec<Call>>,
    writes: AtomicUsize,
    fail_on_write: Mutex<Option<usize>>,
    blocked: Mutex<bool>,
    unblocked: Condvar,
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub factory_closed: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the `n`th add/delete call (1-based, counted across sessions) fail.
    pub fn fail_on_write(&self, n: usize) {
        *self.fail_on_write.lock().unwrap() = Some(n);
    }

    /// Makes writes wait until [`MockBackend::unblock_writes`] is called.
    pub fn block_writes(&self) {
        *self.blocked.lock().unwrap() = true;
    }

    pub fn unblock_writes(&self) {
        *self.blocked.lock().unwrap() = false;
        self.unblocked.notify_all();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn write_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.write_size().is_some())
            .collect()
    }

    pub fn triples(&self) -> HashSet<Triple> {
        self.triples.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.triples.lock().unwrap().len()
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.triples.lock().unwrap().contains(triple)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst) - self.sessions_closed.load(Ordering::SeqCst)
    }

    fn write(&self, call: Call) -> Result<()> {
        let mut blocked = self.blocked.lock().unwrap();
        while *blocked {
            blocked = self.unblocked.wait(blocked).unwrap();
        }
        drop(blocked);

        let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_on_write.lock().unwrap() == Some(n) {
            return Err(anyhow!("mock backend rejected write #{}", n));
        }
        {
            let mut triples = self.triples.lock().unwrap();
            match &call {
                Call::Add(set) => triples.extend(set.iter().cloned()),
                Call::Delete(set) => triples.retain(|t| !set.contains(t)),
                _ => {}
            }
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

pub struct MockSession {
    backend: Arc<MockBackend>,
    closed: bool,
}

impl MockSession {
    pub fn new(backend: Arc<MockBackend>) -> Self {
        backend.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Self {
            backend,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(anyhow!("mock session is closed"))
        } else {
            Ok(())
        }
    }

    fn check_language(language: &str) -> Result<()> {
        if language == MOCK_LANGUAGE {
            Ok(())
        } else {
            Err(Error::new(UnsupportedOperation::new(format!(
                "query language '{}'",
                language
            ))))
        }
    }
}

impl Session for MockSession {
    fn add(&mut self, triples: &HashSet<Triple>) -> Result<()> {
        self.check_open()?;
        self.backend.write(Call::Add(triples.clone()))
    }

    fn delete(&mut self, triples: &HashSet<Triple>) -> Result<()> {
        self.check_open()?;
        self.backend.write(Call::Delete(triples.clone()))
    }

    /// Returns one `?s ?p ?o` row per stored triple, whatever the query text.
    fn query(&mut self, language: &str, text: &str) -> Result<TupleIter> {
        self.check_open()?;
        Self::check_language(language)?;
        self.backend.calls.lock().unwrap().push(Call::Query(text.to_string()));
        let vars: Arc<[String]> = vec!["s".to_string(), "p".to_string(), "o".to_string()].into();
        let rows = self
            .backend
            .triples()
            .into_iter()
            .map(|t| {
                Tuple::new(
                    vars.clone(),
                    vec![
                        Some(t.subject.into()),
                        Some(t.predicate.into()),
                        Some(t.object),
                    ],
                )
            })
            .collect();
        Ok(Box::new(VecResultIter::new(rows)))
    }

    fn find_triples(&mut self, pattern: &TriplePattern) -> Result<TripleIter> {
        self.check_open()?;
        self.backend.calls.lock().unwrap().push(Call::FindTriples);
        let triples = self
            .backend
            .triples()
            .into_iter()
            .filter(|t| pattern.matches(t))
            .collect();
        Ok(Box::new(VecResultIter::new(triples)))
    }

    fn construct(&mut self, language: &str, text: &str) -> Result<TripleIter> {
        self.check_open()?;
        Self::check_language(language)?;
        self.backend
            .calls
            .lock()
            .unwrap()
            .push(Call::Construct(text.to_string()));
        Ok(Box::new(VecResultIter::new(
            self.backend.triples().into_iter().collect(),
        )))
    }

    fn supported_query_languages(&self) -> Vec<String> {
        vec![MOCK_LANGUAGE.to_string()]
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.backend.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct MockFactory {
    pub backend: Arc<MockBackend>,
}

impl MockFactory {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

impl SessionFactory for MockFactory {
    fn new_session(&self) -> Result<Box<dyn Session>> {
        if self.backend.factory_closed.load(Ordering::SeqCst) {
            return Err(anyhow!("mock factory is closed"));
        }
        Ok(Box::new(MockSession::new(self.backend.clone())))
    }

    fn supported_query_languages(&self) -> Vec<String> {
        vec![MOCK_LANGUAGE.to_string()]
    }

    fn close(&self) -> Result<()> {
        self.backend.factory_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A triple source that records whether it was closed.
pub struct TrackedSource {
    items: std::vec::IntoIter<Result<Triple>>,
    pub closed: Arc<AtomicBool>,
}

impl TrackedSource {
    pub fn new(items: Vec<Result<Triple>>) -> Self {
        Self {
            items: items.into_iter(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Iterator for TrackedSource {
    type Item = Result<Triple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

impl ResultIter<Triple> for TrackedSource {
    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn triple(n: usize) -> Triple {
    Triple::new(
        NamedNode::new_unchecked(format!("http://example.org/s{}", n)),
        NamedNode::new_unchecked("http://example.org/p"),
        NamedNode::new_unchecked(format!("http://example.org/o{}", n)),
    )
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
