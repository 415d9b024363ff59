//! Buffered, concurrent write coordination and pooled reads over a triplestore.
//!
//! A [`ConcurrentWriter`] collects adds and deletes from many threads in an [`UpdateBuffer`] and
//! writes them in bounded batches through one update session. Reads borrow sessions from a
//! [`SessionPool`]; their result streams hand the session back when they are done.

extern crate derive_builder;

pub mod buffer;
pub mod config;
pub mod errors;
pub mod io;
pub mod iter;
pub mod options;
pub mod pool;
pub mod reader;
pub mod session;
pub mod single_writer;
pub mod writer;

pub use buffer::{FlushErrorHandler, PendingUpdate, UpdateBuffer};
pub use config::WriterConfig;
pub use io::OxigraphSessionFactory;
pub use options::{FlushMode, ReadOptions, UpdateFilter, UpdateKind};
pub use pool::{GrowableSessionPool, PoolStats, PooledSession, SessionPool, SingleSessionPool};
pub use reader::PooledReader;
pub use session::{ResultIter, Session, SessionFactory, TriplePattern, Tuple};
pub use single_writer::SingleWriterSession;
pub use writer::ConcurrentWriter;

pub fn init_logging() {
    // RDFPOOL_LOG takes precedence over RUST_LOG
    if let Ok(log_level) = std::env::var("RDFPOOL_LOG") {
        std::env::set_var("RUST_LOG", log_level);
    }
}
