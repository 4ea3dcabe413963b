//! Pooled OS worker thread.
//!
//! A worker parks on its wake channel between work items. Waking it with
//! [`Wake::Exit`] (or dropping the sender) ends the loop; it is never
//! pre-empted mid-item.

use broker_core::error::panic_message;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, trace};

use crate::pool::PoolShared;

pub(crate) type Work = Box<dyn FnOnce() + Send + 'static>;

/// A work item handed to a worker at wake time.
pub(crate) struct Job {
    pub work: Work,
    /// Signalled once the item has finished and the worker is idle again.
    pub done: Option<Sender<()>>,
}

pub(crate) enum Wake {
    Run(Job),
    Exit,
}

thread_local! {
    /// Address of the pool that owns the current thread, 0 if none.
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// True when called from one of `shared`'s own workers.
pub(crate) fn on_worker_of(shared: &Arc<PoolShared>) -> bool {
    CURRENT_POOL.with(|p| p.get() == Arc::as_ptr(shared) as usize)
}

pub(crate) struct WorkerThread {
    id: u64,
    wake: Sender<Wake>,
    last_activity: Arc<Mutex<Instant>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn the OS thread. It parks immediately until woken.
    pub(crate) fn start(id: u64, shared: Arc<PoolShared>) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let activity = Arc::clone(&last_activity);

        let handle = std::thread::Builder::new()
            .name(format!("{}-worker-{}", shared.name(), id))
            .spawn(move || worker_loop(id, rx, activity, shared))?;

        Ok(Self {
            id,
            wake: tx,
            last_activity,
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Sender used to wake this worker.
    pub(crate) fn waker(&self) -> Sender<Wake> {
        self.wake.clone()
    }

    /// Ask the worker to exit and wait for its thread.
    pub(crate) fn terminate(mut self) {
        let _ = self.wake.send(Wake::Exit);
        self.join();
    }

    /// Block until the OS thread returns.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!(worker = self.id, "Worker thread ended with a panic");
        }
    }

    /// Drop the join handle without waiting. The thread is already on its
    /// way out of its loop.
    pub(crate) fn detach(mut self) {
        self.handle.take();
    }
}

fn worker_loop(
    id: u64,
    rx: Receiver<Wake>,
    last_activity: Arc<Mutex<Instant>>,
    shared: Arc<PoolShared>,
) {
    CURRENT_POOL.with(|p| p.set(Arc::as_ptr(&shared) as usize));

    // When we wake up we already reside in the running set.
    while let Ok(wake) = rx.recv() {
        let job = match wake {
            Wake::Run(job) => job,
            Wake::Exit => {
                trace!(pool = %shared.name(), worker = id, "Exit requested");
                break;
            }
        };

        *last_activity.lock() = Instant::now();
        trace!(pool = %shared.name(), worker = id, "Work starting");

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job.work)) {
            error!(
                pool = %shared.name(),
                worker = id,
                error = %panic_message(payload.as_ref()),
                "Work item panicked"
            );
        }

        *last_activity.lock() = Instant::now();
        trace!(pool = %shared.name(), worker = id, "Work finished");

        let keep_running = shared.worker_finished(id);
        if let Some(done) = job.done {
            let _ = done.send(());
        }
        if !keep_running {
            break;
        }
    }
}
