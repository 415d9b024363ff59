//! Defines the narrow interfaces a triplestore backend implements: [`Session`] for one
//! connection and [`SessionFactory`] for producing them, plus the result types they return.

use anyhow::Result;
use oxigraph::model::{NamedNode, NamedOrBlankNode, Term, Triple};
use std::collections::HashSet;
use std::sync::Arc;

/// A result stream that can be closed before it is exhausted.
///
/// `next()` returning `None` means the stream is exhausted. `close()` must be idempotent.
pub trait ResultIter<T>: Iterator<Item = Result<T>> + Send {
    fn close(&mut self) -> Result<()>;
}

pub type TripleIter = Box<dyn ResultIter<Triple>>;
pub type TupleIter = Box<dyn ResultIter<Tuple>>;

impl<T, I: ResultIter<T> + ?Sized> ResultIter<T> for Box<I> {
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// One connection to a backend graph store. Not safe for concurrent use, hence `&mut self`.
pub trait Session: Send {
    /// Adds every triple in the set.
    fn add(&mut self, triples: &HashSet<Triple>) -> Result<()>;

    /// Deletes every triple in the set.
    fn delete(&mut self, triples: &HashSet<Triple>) -> Result<()>;

    /// Runs a query that produces variable bindings.
    fn query(&mut self, language: &str, text: &str) -> Result<TupleIter>;

    /// Returns the triples matching a pattern; unset positions match anything.
    fn find_triples(&mut self, pattern: &TriplePattern) -> Result<TripleIter>;

    /// Runs a query that produces triples (e.g. SPARQL CONSTRUCT).
    fn construct(&mut self, language: &str, text: &str) -> Result<TripleIter>;

    fn supported_query_languages(&self) -> Vec<String>;

    fn close(&mut self) -> Result<()>;
}

/// Produces sessions for one backend.
pub trait SessionFactory: Send + Sync {
    fn new_session(&self) -> Result<Box<dyn Session>>;

    fn supported_query_languages(&self) -> Vec<String>;

    fn close(&self) -> Result<()>;
}

/// A triple pattern where `None` is a wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TriplePattern {
    pub subject: Option<NamedOrBlankNode>,
    pub predicate: Option<NamedNode>,
    pub object: Option<Term>,
}

impl TriplePattern {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(
        subject: Option<NamedOrBlankNode>,
        predicate: Option<NamedNode>,
        object: Option<Term>,
    ) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<NamedOrBlankNode>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_predicate(mut self, predicate: NamedNode) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_object(mut self, object: impl Into<Term>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_ref().map_or(true, |s| *s == triple.subject)
            && self.predicate.as_ref().map_or(true, |p| *p == triple.predicate)
            && self.object.as_ref().map_or(true, |o| *o == triple.object)
    }
}

/// One row of variable bindings. Rows from the same query share their variable names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tuple {
    variables: Arc<[String]>,
    values: Vec<Option<Term>>,
}

impl Tuple {
    pub fn new(variables: Arc<[String]>, values: Vec<Option<Term>>) -> Self {
        debug_assert_eq!(variables.len(), values.len());
        Self { variables, values }
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn values(&self) -> &[Option<Term>] {
        &self.values
    }

    pub fn get(&self, variable: &str) -> Option<&Term> {
        let index = self.variables.iter().position(|v| v == variable)?;
        self.values.get(index).and_then(|v| v.as_ref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut first = true;
        for (name, value) in self.variables.iter().zip(self.values.iter()) {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match value {
                Some(term) => write!(f, "?{}={}", name, term)?,
                None => write!(f, "?{}=UNDEF", name)?,
            }
        }
        Ok(())
    }
}

/// A materialized result stream. Backends that collect their results eagerly return this.
pub struct VecResultIter<T> {
    items: std::vec::IntoIter<Result<T>>,
    closed: bool,
}

impl<T> VecResultIter<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self::from_results(items.into_iter().map(Ok).collect())
    }

    pub fn from_results(items: Vec<Result<T>>) -> Self {
        Self {
            items: items.into_iter(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> Iterator for VecResultIter<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }
        self.items.next()
    }
}

impl<T: Send> ResultIter<T> for VecResultIter<T> {
    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            // drop whatever was not consumed
            self.items = Vec::new().into_iter();
        }
        Ok(())
    }
}
