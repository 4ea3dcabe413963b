use broker_core::config::PoolConfig;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::error::PoolError;
use crate::worker::{self, Job, Wake, WorkerThread};

/// State shared between the pool handle and its worker threads.
///
/// `idle` and `running` each have their own lock and are never held at
/// the same time.
pub(crate) struct PoolShared {
    name: String,
    min_threads: usize,
    /// 0 = unbounded.
    max_threads: usize,
    idle_wait: Option<Duration>,
    idle: Mutex<VecDeque<WorkerThread>>,
    running: Mutex<HashMap<u64, WorkerThread>>,
    current: AtomicUsize,
    dying: AtomicBool,
    next_id: AtomicU64,
}

impl PoolShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Called by a worker after its item completes. Moves it from the
    /// running set back to idle; returns false when the worker should exit
    /// instead because the pool is shutting down.
    pub(crate) fn worker_finished(&self, id: u64) -> bool {
        let Some(worker) = self.running.lock().remove(&id) else {
            error!(pool = %self.name, worker = id, "Finished worker missing from running set");
            self.current.fetch_sub(1, Ordering::AcqRel);
            return false;
        };

        if self.dying.load(Ordering::Acquire) {
            trace!(pool = %self.name, worker = id, "Pool dying, worker exits after its item");
            self.current.fetch_sub(1, Ordering::AcqRel);
            worker.detach();
            return false;
        }

        self.idle.lock().push_front(worker);
        true
    }

    /// Reserve a slot for a new worker, honoring `max_threads`.
    fn try_reserve(&self) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (self.max_threads == 0 || n < self.max_threads).then_some(n + 1)
            })
            .is_ok()
    }

    /// Release a slot for a reaped worker, never dropping below `min_threads`.
    fn try_release_above_min(&self) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > self.min_threads).then(|| n - 1)
            })
            .is_ok()
    }

    fn spawn_worker(self: &Arc<Self>) -> std::io::Result<WorkerThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        WorkerThread::start(id, Arc::clone(self))
    }
}

/// Size-bounded pool of reusable worker threads.
///
/// Grows on demand up to `max_threads`, shrinks idle workers back to
/// `min_threads` when [`ThreadPool::reap_idle`] is called, and refuses new
/// work once shutdown has begun. Dropping the pool shuts it down.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Create a pool with `initial_size` parked workers.
    ///
    /// A bounded `max_threads` is raised to `initial_size`; `min_threads`
    /// is capped at `initial_size`. `idle_wait == None` disables reaping.
    pub fn new(
        initial_size: usize,
        name: &str,
        min_threads: usize,
        max_threads: usize,
        idle_wait: Option<Duration>,
    ) -> Result<Self, PoolError> {
        let cfg = PoolConfig {
            name: name.to_string(),
            initial_size,
            min_threads,
            max_threads,
            idle_deallocation_secs: 0,
        }
        .normalized();

        let shared = Arc::new(PoolShared {
            name: cfg.name,
            min_threads: cfg.min_threads,
            max_threads: cfg.max_threads,
            idle_wait: idle_wait.filter(|d| !d.is_zero()),
            idle: Mutex::new(VecDeque::with_capacity(initial_size)),
            running: Mutex::new(HashMap::new()),
            current: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });

        let pool = Self { shared };
        for _ in 0..initial_size {
            let worker = pool.shared.spawn_worker()?;
            pool.shared.current.fetch_add(1, Ordering::AcqRel);
            pool.shared.idle.lock().push_front(worker);
        }

        info!(
            pool = %pool.shared.name,
            initial = initial_size,
            min = pool.shared.min_threads,
            max = pool.shared.max_threads,
            "Thread pool started"
        );
        Ok(pool)
    }

    /// Build from configuration.
    pub fn from_config(cfg: &PoolConfig) -> Result<Self, PoolError> {
        Self::new(
            cfg.initial_size,
            &cfg.name,
            cfg.min_threads,
            cfg.max_threads,
            cfg.idle_deallocation(),
        )
    }

    /// Hand `work` to an idle worker, creating one if below `max_threads`.
    ///
    /// `done` is signalled after the item finishes and the worker is back
    /// in the idle set (also when the item panics).
    pub fn submit<F>(&self, work: F, done: Option<Sender<()>>) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        if shared.dying.load(Ordering::Acquire) {
            trace!(pool = %shared.name, "Submit refused, pool is dying");
            return Err(PoolError::Unavailable(shared.name.clone()));
        }

        let popped = shared.idle.lock().pop_front();
        let worker = match popped {
            Some(worker) => worker,
            None => {
                if !shared.try_reserve() {
                    let running = shared.running.lock().len();
                    debug!(
                        pool = %shared.name,
                        running,
                        max = shared.max_threads,
                        "Insufficient resources"
                    );
                    return Err(PoolError::InsufficientResources {
                        pool: shared.name.clone(),
                        running,
                    });
                }
                match shared.spawn_worker() {
                    Ok(worker) => worker,
                    Err(e) => {
                        shared.current.fetch_sub(1, Ordering::AcqRel);
                        error!(pool = %shared.name, error = %e, "Could not create worker thread");
                        return Err(if e.kind() == std::io::ErrorKind::OutOfMemory {
                            PoolError::InsufficientResources {
                                pool: shared.name.clone(),
                                running: shared.running.lock().len(),
                            }
                        } else {
                            PoolError::SetupFailure(e)
                        });
                    }
                }
            }
        };

        let id = worker.id();
        let waker = worker.waker();
        shared.running.lock().insert(id, worker);

        trace!(pool = %shared.name, worker = id, "Waking worker");
        let job = Job {
            work: Box::new(work),
            done,
        };
        if waker.send(Wake::Run(job)).is_err() {
            // The worker thread is gone; forget it.
            if let Some(worker) = shared.running.lock().remove(&id) {
                worker.detach();
            }
            shared.current.fetch_sub(1, Ordering::AcqRel);
            error!(pool = %shared.name, worker = id, "Worker vanished before wake-up");
            return Err(PoolError::SetupFailure(std::io::Error::other(
                "worker thread is not running",
            )));
        }
        Ok(())
    }

    /// Terminate idle workers whose last activity is older than the idle
    /// interval, never dropping below `min_threads`. Returns how many were
    /// reclaimed. Not self-scheduling.
    pub fn reap_idle(&self) -> usize {
        let shared = &self.shared;
        let Some(wait) = shared.idle_wait else {
            return 0;
        };

        let candidates = shared.idle.lock().len();
        let mut reaped = 0;
        for _ in 0..candidates {
            if shared.current.load(Ordering::Acquire) <= shared.min_threads {
                break;
            }
            // Oldest idle workers live at the back.
            let Some(worker) = shared.idle.lock().pop_back() else {
                break;
            };

            if worker.idle_for() > wait && shared.try_release_above_min() {
                trace!(pool = %shared.name, worker = worker.id(), "Reaping idle worker");
                worker.terminate();
                reaped += 1;
            } else {
                shared.idle.lock().push_front(worker);
            }
        }

        if reaped > 0 {
            debug!(pool = %shared.name, reaped, remaining = self.current_threads(), "Reaped idle workers");
        }
        reaped
    }

    /// Refuse new work, then terminate and join every worker as it becomes
    /// idle. Running items are allowed to finish; they are never interrupted.
    /// Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.dying.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pool = %shared.name, threads = self.current_threads(), "Shutting down thread pool");

        // A worker dropping the last pool handle cannot wait for itself.
        let floor = usize::from(worker::on_worker_of(shared));
        if floor > 0 {
            warn!(pool = %shared.name, "Pool shut down from one of its own workers");
        }

        loop {
            let popped = shared.idle.lock().pop_front();
            match popped {
                Some(worker) => {
                    worker.terminate();
                    shared.current.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    if shared.current.load(Ordering::Acquire) <= floor {
                        break;
                    }
                    std::thread::yield_now();
                }
            }
        }
        debug!(pool = %shared.name, "Thread pool stopped");
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn min_threads(&self) -> usize {
        self.shared.min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.dying.load(Ordering::Acquire)
    }

    /// Live worker count (idle + running).
    pub fn current_threads(&self) -> usize {
        self.shared.current.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.shared.running.lock().len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
