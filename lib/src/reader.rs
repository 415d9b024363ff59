//! Read side of a writer: every query borrows a session from a [`SessionPool`] and hands it
//! back once the returned stream is exhausted, closed or dropped.

use crate::errors::NoSessionAvailable;
use crate::iter::{Distinct, Limit, ReleasingIter};
use crate::options::ReadOptions;
use crate::pool::{PooledSession, SessionPool};
use crate::session::{ResultIter, TripleIter, TriplePattern, TupleIter};
use anyhow::{Error, Result};
use log::debug;
use std::hash::Hash;
use std::sync::Arc;

#[derive(Clone)]
pub struct PooledReader {
    pool: Arc<dyn SessionPool>,
}

impl std::fmt::Debug for PooledReader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PooledReader")
            .field("stats", &self.pool.stats())
            .finish()
    }
}

impl PooledReader {
    pub fn new(pool: Arc<dyn SessionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<dyn SessionPool> {
        &self.pool
    }

    fn lease(&self) -> Result<PooledSession> {
        match self.pool.get()? {
            Some(session) => Ok(session),
            None => {
                debug!("Session pool exhausted: {:?}", self.pool.stats());
                Err(Error::new(NoSessionAvailable {
                    max: self.pool.max_size(),
                }))
            }
        }
    }

    /// Runs a tuple query. The leased session stays out of the pool until the result is
    /// exhausted, closed or dropped.
    pub fn find_tuples(&self, language: &str, text: &str, options: ReadOptions) -> Result<TupleIter> {
        let mut lease = self.lease()?;
        // on error the lease is dropped, which returns it to the pool
        let rows = lease.query(language, text)?;
        Ok(shape(Box::new(ReleasingIter::new(rows, lease)), options))
    }

    pub fn find_triples(&self, pattern: &TriplePattern, options: ReadOptions) -> Result<TripleIter> {
        let mut lease = self.lease()?;
        let triples = lease.find_triples(pattern)?;
        Ok(shape(Box::new(ReleasingIter::new(triples, lease)), options))
    }

    /// Runs a graph-producing query (e.g. SPARQL CONSTRUCT).
    pub fn construct_triples(
        &self,
        language: &str,
        text: &str,
        options: ReadOptions,
    ) -> Result<TripleIter> {
        let mut lease = self.lease()?;
        let triples = lease.construct(language, text)?;
        Ok(shape(Box::new(ReleasingIter::new(triples, lease)), options))
    }

    pub fn count_tuples(&self, language: &str, text: &str, options: ReadOptions) -> Result<usize> {
        count(self.find_tuples(language, text, options)?)
    }

    pub fn count_triples(&self, pattern: &TriplePattern, options: ReadOptions) -> Result<usize> {
        count(self.find_triples(pattern, options)?)
    }

    pub fn supported_query_languages(&self) -> Vec<String> {
        self.pool.supported_query_languages()
    }
}

/// Distinct runs before Limit, so a limit counts distinct rows.
fn shape<T>(iter: Box<dyn ResultIter<T>>, options: ReadOptions) -> Box<dyn ResultIter<T>>
where
    T: Hash + Eq + Clone + Send + 'static,
{
    let iter: Box<dyn ResultIter<T>> = if options.distinct {
        Box::new(Distinct::new(iter))
    } else {
        iter
    };
    match options.limit {
        Some(limit) => Box::new(Limit::new(iter, limit)),
        None => iter,
    }
}

fn count<T>(mut iter: Box<dyn ResultIter<T>>) -> Result<usize> {
    let mut n = 0;
    let drained = loop {
        match iter.next() {
            Some(Ok(_)) => n += 1,
            Some(Err(err)) => break Err(err),
            None => break Ok(n),
        }
    };
    let closed = iter.close();
    let n = drained?;
    closed?;
    Ok(n)
}

