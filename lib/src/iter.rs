//! Decorators over backend result streams.
//!
//! [`ReleasingIter`] ties a leased resource (a pooled session or a single-writer lock) to the
//! lifetime of a result stream. The resource is released as soon as the stream is exhausted,
//! when it is closed, or when it is dropped, whichever comes first. [`Distinct`], [`Limit`]
//! and [`TupleToTriple`] reshape rows and can be stacked on top of it.

use crate::session::{ResultIter, Tuple};
use anyhow::Result;
use log::debug;
use oxigraph::model::{Literal, NamedNode, NamedOrBlankNode, Term, Triple};
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// A resource that is handed back when a result stream no longer needs it.
pub trait Releasable: Send {
    fn release(self);
}

pub struct ReleasingIter<I, R: Releasable> {
    inner: I,
    resource: Option<R>,
    closed: bool,
}

impl<I, R: Releasable> ReleasingIter<I, R> {
    pub fn new(inner: I, resource: R) -> Self {
        Self {
            inner,
            resource: Some(resource),
            closed: false,
        }
    }

    /// True while the resource has not been released yet.
    pub fn holds_resource(&self) -> bool {
        self.resource.is_some()
    }

    fn release_resource(&mut self) {
        if let Some(resource) = self.resource.take() {
            resource.release();
        }
    }
}

impl<I: Iterator, R: Releasable> Iterator for ReleasingIter<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        match self.inner.next() {
            Some(item) => Some(item),
            None => {
                self.release_resource();
                None
            }
        }
    }
}

impl<T, I: ResultIter<T>, R: Releasable> ResultIter<T> for ReleasingIter<I, R> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let res = self.inner.close();
        self.release_resource();
        res
    }
}

impl<I, R: Releasable> Drop for ReleasingIter<I, R> {
    fn drop(&mut self) {
        if self.resource.is_some() {
            debug!("Result iterator dropped before being closed or exhausted; releasing its session");
            self.release_resource();
        }
    }
}

/// Suppresses rows that were already returned.
pub struct Distinct<T, I> {
    inner: I,
    seen: HashSet<T>,
}

impl<T, I> Distinct<T, I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            seen: HashSet::new(),
        }
    }
}

impl<T, I> Iterator for Distinct<T, I>
where
    T: Hash + Eq + Clone,
    I: Iterator<Item = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok(row) => {
                    if self.seen.insert(row.clone()) {
                        return Some(Ok(row));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<T, I> ResultIter<T> for Distinct<T, I>
where
    T: Hash + Eq + Clone + Send,
    I: ResultIter<T>,
{
    fn close(&mut self) -> Result<()> {
        self.seen.clear();
        self.inner.close()
    }
}

/// Reports exhaustion after `limit` rows. The wrapped stream is only closed by `close()`.
pub struct Limit<I> {
    inner: I,
    remaining: usize,
}

impl<I> Limit<I> {
    pub fn new(inner: I, limit: usize) -> Self {
        Self {
            inner,
            remaining: limit,
        }
    }
}

impl<I: Iterator> Iterator for Limit<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.inner.next()?;
        self.remaining -= 1;
        Some(item)
    }
}

impl<T, I: ResultIter<T>> ResultIter<T> for Limit<I> {
    fn close(&mut self) -> Result<()> {
        self.remaining = 0;
        self.inner.close()
    }
}

/// One position of a [`TripleTemplate`]: either a fixed term or a variable bound by each row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateTerm {
    Variable(String),
    Constant(Term),
}

impl TemplateTerm {
    pub fn variable(name: impl Into<String>) -> Self {
        TemplateTerm::Variable(name.into())
    }

    fn resolve<'a>(&'a self, row: &'a Tuple) -> Option<&'a Term> {
        match self {
            TemplateTerm::Variable(name) => row.get(name),
            TemplateTerm::Constant(term) => Some(term),
        }
    }
}

impl From<Term> for TemplateTerm {
    fn from(value: Term) -> Self {
        TemplateTerm::Constant(value)
    }
}

impl From<NamedNode> for TemplateTerm {
    fn from(value: NamedNode) -> Self {
        TemplateTerm::Constant(value.into())
    }
}

impl From<Literal> for TemplateTerm {
    fn from(value: Literal) -> Self {
        TemplateTerm::Constant(value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripleTemplate {
    pub subject: TemplateTerm,
    pub predicate: TemplateTerm,
    pub object: TemplateTerm,
}

impl TripleTemplate {
    pub fn new(subject: TemplateTerm, predicate: TemplateTerm, object: TemplateTerm) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// Builds the triple for one row, or `None` if a variable is unbound or a term
    /// cannot occupy its position (e.g. a literal subject).
    pub fn instantiate(&self, row: &Tuple) -> Option<Triple> {
        let subject: NamedOrBlankNode = match self.subject.resolve(row)? {
            Term::NamedNode(n) => n.clone().into(),
            Term::BlankNode(b) => b.clone().into(),
            _ => return None,
        };
        let predicate: NamedNode = match self.predicate.resolve(row)? {
            Term::NamedNode(n) => n.clone(),
            _ => return None,
        };
        let object = self.object.resolve(row)?.clone();
        Some(Triple::new(subject, predicate, object))
    }
}

/// Flattens a tuple stream into the triples produced by applying templates to each row.
pub struct TupleToTriple<I> {
    inner: I,
    templates: Vec<TripleTemplate>,
    pending: VecDeque<Triple>,
}

impl<I> TupleToTriple<I> {
    pub fn new(inner: I, templates: Vec<TripleTemplate>) -> Self {
        Self {
            inner,
            templates,
            pending: VecDeque::new(),
        }
    }
}

impl<I: Iterator<Item = Result<Tuple>>> Iterator for TupleToTriple<I> {
    type Item = Result<Triple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(triple) = self.pending.pop_front() {
                return Some(Ok(triple));
            }
            match self.inner.next()? {
                Ok(row) => {
                    let produced = self.templates.iter().filter_map(|t| t.instantiate(&row));
                    self.pending.extend(produced);
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl<I: ResultIter<Tuple>> ResultIter<Triple> for TupleToTriple<I> {
    fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::VecResultIter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter(Arc<AtomicUsize>);

    impl Releasable for Counter {
        fn release(self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn releases_on_exhaustion_without_close() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut iter = ReleasingIter::new(
            VecResultIter::new(vec![1, 2]),
            Counter(released.clone()),
        );
        assert_eq!(iter.next().unwrap().unwrap(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(iter.next().unwrap().unwrap(), 2);
        assert!(iter.next().is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        // an explicit close afterwards must not release twice
        iter.close().unwrap();
        iter.close().unwrap();
        drop(iter);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn releases_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut iter = ReleasingIter::new(
            VecResultIter::new(vec![1, 2, 3]),
            Counter(released.clone()),
        );
        iter.next();
        drop(iter);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    struct FailingClose;

    impl Iterator for FailingClose {
        type Item = Result<u32>;
        fn next(&mut self) -> Option<Self::Item> {
            Some(Ok(0))
        }
    }

    impl ResultIter<u32> for FailingClose {
        fn close(&mut self) -> Result<()> {
            Err(anyhow::anyhow!("close failed"))
        }
    }

    #[test]
    fn releases_even_when_inner_close_fails() {
        let released = Arc::new(AtomicUsize::new(0));
        let mut iter = ReleasingIter::new(FailingClose, Counter(released.clone()));
        assert!(iter.close().is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(iter.close().is_ok());
        assert!(iter.next().is_none());
    }

    #[test]
    fn distinct_then_limit() {
        let rows = VecResultIter::new(vec![1, 1, 2, 3, 2, 4]);
        let mut iter = Limit::new(Distinct::new(rows), 3);
        let out: Vec<u32> = iter.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec![1, 2, 3]);
        iter.close().unwrap();
    }

    #[test]
    fn distinct_passes_errors_through() {
        let rows = VecResultIter::from_results(vec![
            Ok(1),
            Err(anyhow::anyhow!("boom")),
            Ok(1),
            Ok(2),
        ]);
        let out: Vec<Result<u32>> = Distinct::new(rows).collect();
        assert_eq!(out.len(), 3);
        assert!(out[1].is_err());
    }

    #[test]
    fn tuple_to_triple_flattens_rows() {
        let vars: Arc<[String]> = vec!["s".to_string(), "o".to_string()].into();
        let p = NamedNode::new_unchecked("http://ex/p");
        let rows = vec![
            Tuple::new(
                vars.clone(),
                vec![
                    Some(NamedNode::new_unchecked("http://ex/a").into()),
                    Some(Literal::new_simple_literal("1").into()),
                ],
            ),
            // literal subject: the first template yields nothing for this row
            Tuple::new(
                vars.clone(),
                vec![
                    Some(Literal::new_simple_literal("x").into()),
                    Some(NamedNode::new_unchecked("http://ex/b").into()),
                ],
            ),
            // unbound object: skipped by both templates
            Tuple::new(
                vars,
                vec![Some(NamedNode::new_unchecked("http://ex/c").into()), None],
            ),
        ];
        let templates = vec![
            TripleTemplate::new(
                TemplateTerm::variable("s"),
                p.clone().into(),
                TemplateTerm::variable("o"),
            ),
            TripleTemplate::new(
                TemplateTerm::variable("o"),
                p.clone().into(),
                TemplateTerm::variable("s"),
            ),
        ];
        let triples: Vec<Triple> = TupleToTriple::new(VecResultIter::new(rows), templates)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            triples,
            vec![
                Triple::new(
                    NamedNode::new_unchecked("http://ex/a"),
                    p.clone(),
                    Literal::new_simple_literal("1"),
                ),
                Triple::new(
                    NamedNode::new_unchecked("http://ex/b"),
                    p,
                    Literal::new_simple_literal("x"),
                ),
            ]
        );
    }
}
