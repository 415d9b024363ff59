//! Defines a [`SessionFactory`] backed by an oxigraph [`Store`], either in memory or on disk.
//! All sessions from one factory share the same store and work on its default graph.

use crate::errors::UnsupportedOperation;
use crate::session::{
    Session, SessionFactory, TripleIter, TriplePattern, Tuple, TupleIter, VecResultIter,
};
use anyhow::{anyhow, Error, Result};
use log::{debug, info};
use oxigraph::model::{GraphNameRef, Literal, QuadRef, Triple};
use oxigraph::sparql::{QueryResults, SparqlEvaluator};
use oxigraph::store::Store;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const SPARQL: &str = "sparql";

fn check_language(language: &str) -> Result<()> {
    if language.eq_ignore_ascii_case(SPARQL) {
        Ok(())
    } else {
        Err(Error::new(UnsupportedOperation::new(format!(
            "query language '{}'",
            language
        ))))
    }
}

pub struct OxigraphSessionFactory {
    store: Store,
    location: Option<PathBuf>,
    closed: AtomicBool,
}

impl std::fmt::Debug for OxigraphSessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("OxigraphSessionFactory")
            .field("location", &self.location)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl OxigraphSessionFactory {
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_store(Store::new()?))
    }

    /// Opens (or creates) an on-disk store in `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let store = Store::open(path)
            .map_err(|e| anyhow!("Failed to open store at {:?}: {}", path, e))?;
        info!("Opened oxigraph store at {:?}", path);
        Ok(Self {
            store,
            location: Some(path.to_path_buf()),
            closed: AtomicBool::new(false),
        })
    }

    /// Wraps an externally managed store.
    pub fn from_store(store: Store) -> Self {
        Self {
            store,
            location: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Number of quads in the store.
    pub fn len(&self) -> Result<usize> {
        Ok(self.store.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.store.is_empty()?)
    }
}

impl SessionFactory for OxigraphSessionFactory {
    fn new_session(&self) -> Result<Box<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("Session factory is closed"));
        }
        Ok(Box::new(OxigraphSession::new(self.store.clone())))
    }

    fn supported_query_languages(&self) -> Vec<String> {
        vec![SPARQL.to_string()]
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.location.is_some() {
            self.store
                .flush()
                .map_err(|e| anyhow!("Failed to flush store: {}", e))?;
        }
        debug!("Closed oxigraph session factory");
        Ok(())
    }
}

/// One session over a shared oxigraph store.
pub struct OxigraphSession {
    store: Option<Store>,
}

impl OxigraphSession {
    pub fn new(store: Store) -> Self {
        Self { store: Some(store) }
    }

    fn store(&self) -> Result<&Store> {
        self.store
            .as_ref()
            .ok_or_else(|| anyhow!("Session is closed"))
    }
}

impl Session for OxigraphSession {
    fn add(&mut self, triples: &HashSet<Triple>) -> Result<()> {
        let store = self.store()?;
        for t in triples {
            store.insert(QuadRef::new(
                t.subject.as_ref(),
                t.predicate.as_ref(),
                t.object.as_ref(),
                GraphNameRef::DefaultGraph,
            ))?;
        }
        Ok(())
    }

    fn delete(&mut self, triples: &HashSet<Triple>) -> Result<()> {
        let store = self.store()?;
        for t in triples {
            store.remove(QuadRef::new(
                t.subject.as_ref(),
                t.predicate.as_ref(),
                t.object.as_ref(),
                GraphNameRef::DefaultGraph,
            ))?;
        }
        Ok(())
    }

    fn query(&mut self, language: &str, text: &str) -> Result<TupleIter> {
        check_language(language)?;
        let store = self.store()?;
        let results = SparqlEvaluator::new()
            .parse_query(text)?
            .on_store(store)
            .execute()?;
        match results {
            QueryResults::Solutions(solutions) => {
                let variables: Arc<[String]> = solutions
                    .variables()
                    .iter()
                    .map(|v| v.as_str().to_string())
                    .collect();
                let mut rows = Vec::new();
                for solution in solutions {
                    let solution = solution?;
                    rows.push(Tuple::new(variables.clone(), solution.values().to_vec()));
                }
                Ok(Box::new(VecResultIter::new(rows)))
            }
            QueryResults::Boolean(value) => {
                let variables: Arc<[String]> = vec!["result".to_string()].into();
                let row = Tuple::new(variables, vec![Some(Literal::from(value).into())]);
                Ok(Box::new(VecResultIter::new(vec![row])))
            }
            _ => Err(Error::new(UnsupportedOperation::new(
                "graph-producing query through query(); use construct()",
            ))),
        }
    }

    fn find_triples(&mut self, pattern: &TriplePattern) -> Result<TripleIter> {
        let store = self.store()?;
        let mut triples = Vec::new();
        for quad in store.quads_for_pattern(
            pattern.subject.as_ref().map(|s| s.as_ref()),
            pattern.predicate.as_ref().map(|p| p.as_ref()),
            pattern.object.as_ref().map(|o| o.as_ref()),
            Some(GraphNameRef::DefaultGraph),
        ) {
            let quad = quad?;
            triples.push(Triple::new(quad.subject, quad.predicate, quad.object));
        }
        Ok(Box::new(VecResultIter::new(triples)))
    }

    fn construct(&mut self, language: &str, text: &str) -> Result<TripleIter> {
        check_language(language)?;
        let store = self.store()?;
        let results = SparqlEvaluator::new()
            .parse_query(text)?
            .on_store(store)
            .execute()?;
        match results {
            QueryResults::Graph(graph) => {
                let mut triples = Vec::new();
                for triple in graph {
                    triples.push(triple?);
                }
                Ok(Box::new(VecResultIter::new(triples)))
            }
            _ => Err(Error::new(UnsupportedOperation::new(
                "construct() requires a CONSTRUCT or DESCRIBE query",
            ))),
        }
    }

    fn supported_query_languages(&self) -> Vec<String> {
        vec![SPARQL.to_string()]
    }

    fn close(&mut self) -> Result<()> {
        self.store = None;
        Ok(())
    }
}
