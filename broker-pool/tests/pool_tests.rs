use broker_pool::{PoolError, ThreadPool};
use crossbeam_channel::{Receiver, bounded, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn wait_all(rx: &Receiver<()>, n: usize) {
    for _ in 0..n {
        rx.recv_timeout(WAIT).expect("work item did not complete");
    }
}

// =============================================================================
// Growth Tests
// =============================================================================

#[test]
fn test_pool_grows_to_max_and_returns_workers_to_idle() {
    let pool = ThreadPool::new(3, "grow", 1, 5, None).unwrap();
    assert_eq!(pool.idle_count(), 3);

    let (release_tx, release_rx) = unbounded::<()>();
    let (done_tx, done_rx) = unbounded();

    for _ in 0..5 {
        let release = release_rx.clone();
        let result = pool.submit(
            move || {
                let _ = release.recv_timeout(WAIT);
                thread::sleep(Duration::from_millis(10));
            },
            Some(done_tx.clone()),
        );
        assert!(result.is_ok());
    }

    assert_eq!(pool.running_count(), 5);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.current_threads(), 5);

    for _ in 0..5 {
        release_tx.send(()).unwrap();
    }
    wait_all(&done_rx, 5);

    assert_eq!(pool.running_count(), 0);
    assert_eq!(pool.idle_count(), 5);
}

#[test]
fn test_sequential_submits_reuse_idle_workers() {
    let pool = ThreadPool::new(3, "reuse", 1, 5, None).unwrap();
    let (done_tx, done_rx) = bounded(1);

    for _ in 0..5 {
        pool.submit(|| thread::sleep(Duration::from_millis(10)), Some(done_tx.clone()))
            .unwrap();
        wait_all(&done_rx, 1);
    }

    assert_eq!(pool.current_threads(), 3);
    assert_eq!(pool.idle_count(), 3);
}

#[test]
fn test_submit_at_max_reports_insufficient_resources() {
    let pool = ThreadPool::new(1, "full", 1, 2, None).unwrap();
    let (release_tx, release_rx) = unbounded::<()>();
    let (done_tx, done_rx) = unbounded();

    for _ in 0..2 {
        let release = release_rx.clone();
        pool.submit(move || { let _ = release.recv_timeout(WAIT); }, Some(done_tx.clone()))
            .unwrap();
    }

    let err = pool.submit(|| {}, None).unwrap_err();
    assert!(matches!(err, PoolError::InsufficientResources { running: 2, .. }));
    assert!(err.is_retryable());

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    wait_all(&done_rx, 2);

    // Capacity is back once a worker idles.
    pool.submit(|| {}, Some(done_tx)).unwrap();
    wait_all(&done_rx, 1);
}

#[test]
fn test_unbounded_pool_grows_past_initial() {
    let pool = ThreadPool::new(1, "unbounded", 1, 0, None).unwrap();
    let (release_tx, release_rx) = unbounded::<()>();
    let (done_tx, done_rx) = unbounded();

    for _ in 0..8 {
        let release = release_rx.clone();
        pool.submit(move || { let _ = release.recv_timeout(WAIT); }, Some(done_tx.clone()))
            .unwrap();
    }
    assert_eq!(pool.current_threads(), 8);

    for _ in 0..8 {
        release_tx.send(()).unwrap();
    }
    wait_all(&done_rx, 8);
    assert_eq!(pool.idle_count(), 8);
}

// =============================================================================
// Reaping Tests
// =============================================================================

#[test]
fn test_reap_idle_stops_at_min_threads() {
    let pool = ThreadPool::new(5, "reap", 2, 10, Some(Duration::from_millis(20))).unwrap();
    thread::sleep(Duration::from_millis(60));

    assert_eq!(pool.reap_idle(), 3);
    assert_eq!(pool.current_threads(), 2);
    assert_eq!(pool.idle_count(), 2);

    thread::sleep(Duration::from_millis(60));
    assert_eq!(pool.reap_idle(), 0);
    assert_eq!(pool.current_threads(), 2);
}

#[test]
fn test_reap_idle_keeps_recent_workers() {
    let pool = ThreadPool::new(4, "recent", 1, 4, Some(Duration::from_secs(60))).unwrap();
    assert_eq!(pool.reap_idle(), 0);
    assert_eq!(pool.current_threads(), 4);
}

#[test]
fn test_reaped_pool_still_serves_work() {
    let pool = ThreadPool::new(3, "reap-serve", 1, 3, Some(Duration::from_millis(10))).unwrap();
    thread::sleep(Duration::from_millis(40));
    assert_eq!(pool.reap_idle(), 2);

    let hits = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = unbounded();
    for _ in 0..3 {
        let h = Arc::clone(&hits);
        pool.submit(move || { h.fetch_add(1, Ordering::SeqCst); }, Some(done_tx.clone()))
            .unwrap();
        wait_all(&done_rx, 1);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Shutdown Tests
// =============================================================================

#[test]
fn test_submit_after_shutdown_is_unavailable() {
    let pool = ThreadPool::new(2, "closed", 1, 4, None).unwrap();
    pool.shutdown();

    for _ in 0..3 {
        let err = pool.submit(|| {}, None).unwrap_err();
        assert!(matches!(err, PoolError::Unavailable(ref name) if name == "closed"));
        assert!(!err.is_retryable());
    }
    assert_eq!(pool.current_threads(), 0);
}

#[test]
fn test_shutdown_waits_for_running_work() {
    let pool = ThreadPool::new(2, "drain", 1, 2, None).unwrap();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let f = Arc::clone(&finished);
        pool.submit(
            move || {
                thread::sleep(Duration::from_millis(30));
                f.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )
        .unwrap();
    }

    pool.shutdown();
    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert_eq!(pool.current_threads(), 0);
}

#[test]
fn test_dropping_pool_inside_its_own_worker() {
    let pool = Arc::new(ThreadPool::new(1, "self-drop", 1, 1, None).unwrap());
    let (done_tx, done_rx) = bounded(1);

    let inner = Arc::clone(&pool);
    pool.submit(move || drop(inner), Some(done_tx)).unwrap();
    drop(pool);

    // Whichever side drops last, nothing deadlocks.
    wait_all(&done_rx, 1);
}
