mod common;

use common::{triple, wait_for, MockBackend, MockFactory};
use rdfpool::options::ReadOptions;
use rdfpool::pool::{GrowableSessionPool, SessionPool};
use rdfpool::reader::PooledReader;
use rdfpool::session::TriplePattern;
use rdfpool::WriterConfig;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pool_config(initial: usize, growth: Option<usize>, spares: usize) -> WriterConfig {
    WriterConfig::builder()
        .pool_initial_size(initial)
        .pool_max_growth(growth)
        .pool_spare_sessions(spares)
        .poll_interval_ms(10)
        .build()
        .unwrap()
}

#[test]
fn exhausted_pool_returns_none_without_blocking() {
    let backend = MockBackend::new();
    let pool =
        GrowableSessionPool::new(MockFactory::new(backend.clone()), &pool_config(1, Some(0), 0))
            .unwrap();

    let first = pool.get().unwrap().expect("one session is available");
    let started = Instant::now();
    assert!(pool.get().unwrap().is_none());
    assert!(started.elapsed() < Duration::from_secs(1));

    let stats = pool.stats();
    assert_eq!((stats.free, stats.in_use, stats.created), (0, 1, 1));

    pool.release(first);
    let again = pool.get().unwrap();
    assert!(again.is_some());
    assert_eq!(backend.sessions_opened.load(Ordering::SeqCst), 1);
}

#[test]
fn unbounded_pool_grows_on_demand() {
    let backend = MockBackend::new();
    let pool = GrowableSessionPool::new(MockFactory::new(backend.clone()), &pool_config(1, None, 0))
        .unwrap();
    let leases: Vec<_> = (0..10).map(|_| pool.get().unwrap().unwrap()).collect();
    let ids: HashSet<u64> = leases.iter().map(|l| l.id()).collect();
    assert_eq!(ids.len(), 10);
    assert_eq!(pool.stats().in_use, 10);
    assert_eq!(pool.max_size(), None);
}

#[test]
fn free_plus_in_use_equals_created_under_load() {
    let backend = MockBackend::new();
    let pool = Arc::new(
        GrowableSessionPool::new(MockFactory::new(backend.clone()), &pool_config(2, Some(3), 1))
            .unwrap(),
    );

    let workers: Vec<_> = (0..6)
        .map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut seen = 0;
                for _ in 0..200 {
                    if let Some(lease) = pool.get().unwrap() {
                        seen += 1;
                        let stats = pool.stats();
                        assert_eq!(stats.free + stats.in_use, stats.created);
                        assert!(stats.created <= 5);
                        pool.release(lease);
                    }
                }
                seen
            })
        })
        .collect();
    let leased: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert!(leased > 0);

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.free, stats.created);
}

#[test]
fn leased_sessions_are_never_shared() {
    let backend = MockBackend::new();
    let pool = GrowableSessionPool::new(MockFactory::new(backend), &pool_config(3, Some(0), 0))
        .unwrap();
    let a = pool.get().unwrap().unwrap();
    let b = pool.get().unwrap().unwrap();
    let c = pool.get().unwrap().unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(b.id(), c.id());
    assert_ne!(a.id(), c.id());
    assert!(pool.get().unwrap().is_none());
}

#[test]
fn foreign_release_is_ignored() {
    let backend = MockBackend::new();
    let config = pool_config(1, Some(0), 0);
    let ours = GrowableSessionPool::new(MockFactory::new(backend.clone()), &config).unwrap();
    let theirs = GrowableSessionPool::new(MockFactory::new(backend.clone()), &config).unwrap();

    let lease = theirs.get().unwrap().unwrap();
    ours.release(lease);

    let stats = ours.stats();
    assert_eq!((stats.free, stats.in_use, stats.created), (1, 0, 1));
    // the lease found its way back to its own pool
    let stats = theirs.stats();
    assert_eq!((stats.free, stats.in_use, stats.created), (1, 0, 1));
}

#[test]
fn maintenance_keeps_spare_sessions_ready() {
    let backend = MockBackend::new();
    let pool =
        GrowableSessionPool::new(MockFactory::new(backend.clone()), &pool_config(1, Some(3), 2))
            .unwrap();

    let _held = pool.get().unwrap().unwrap();
    assert!(wait_for(Duration::from_secs(5), || pool.stats().free >= 2));
    let stats = pool.stats();
    assert!(stats.created <= 4);
    assert_eq!(stats.free + stats.in_use, stats.created);
}

#[test]
fn close_shuts_down_every_session_and_the_factory() {
    let backend = MockBackend::new();
    let pool =
        GrowableSessionPool::new(MockFactory::new(backend.clone()), &pool_config(2, Some(2), 1))
            .unwrap();
    let lease = pool.get().unwrap().unwrap();

    pool.close().unwrap();
    assert!(backend.factory_closed.load(Ordering::SeqCst));
    assert!(pool.get().is_err());

    // the leased session stays open until its lease comes back, then it is closed
    assert_eq!(backend.live_sessions(), 1);
    drop(lease);
    assert_eq!(backend.live_sessions(), 0);
    assert_eq!(pool.stats().free, 0);

    pool.close().unwrap();
}

#[test]
fn exhausted_result_streams_return_their_session() {
    let backend = MockBackend::new();
    let pool: Arc<dyn SessionPool> = Arc::new(
        GrowableSessionPool::new(MockFactory::new(backend.clone()), &pool_config(1, Some(0), 0))
            .unwrap(),
    );
    {
        let mut lease = pool.get().unwrap().unwrap();
        lease
            .add(&(0..3).map(triple).collect::<HashSet<_>>())
            .unwrap();
    }
    let reader = PooledReader::new(pool.clone());

    let mut rows = reader
        .find_triples(&TriplePattern::any(), ReadOptions::new())
        .unwrap();
    assert_eq!(pool.stats().in_use, 1);
    let mut n = 0;
    while let Some(row) = rows.next() {
        row.unwrap();
        n += 1;
    }
    assert_eq!(n, 3);
    // exhausted but neither closed nor dropped
    assert_eq!(pool.stats().in_use, 0);

    // a failing call hands the session back before the error surfaces
    assert!(reader
        .find_tuples("not-a-language", "", ReadOptions::new())
        .is_err());
    assert_eq!(pool.stats().in_use, 0);
    drop(rows);
}
