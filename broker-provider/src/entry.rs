use broker_core::{BrokerError, BrokerHandle, Provider, ProviderKey};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::guarded;
use crate::module::ModuleEntry;

/// Provider lifecycle state.
///
/// `Uninitialized -> Initializing -> Initialized -> Terminating -> Uninitialized`.
/// Failed initialization goes straight back to `Uninitialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProviderStatus {
    Uninitialized = 0,
    Initializing = 1,
    Initialized = 2,
    Terminating = 3,
}

impl ProviderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderStatus::Uninitialized => "uninitialized",
            ProviderStatus::Initializing => "initializing",
            ProviderStatus::Initialized => "initialized",
            ProviderStatus::Terminating => "terminating",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProviderStatus::Initializing,
            2 => ProviderStatus::Initialized,
            3 => ProviderStatus::Terminating,
            _ => ProviderStatus::Uninitialized,
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an unload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Unloaded,
    /// Operations are in flight; nothing was changed.
    Busy,
    /// The provider was not initialized.
    NotLoaded,
}

/// Everything guarded by the status lock.
pub(crate) struct ProviderState {
    status: ProviderStatus,
    instance: Option<Arc<dyn Provider>>,
    broker: Option<BrokerHandle>,
    /// Error text of the last failed initialization.
    last_failure: Option<String>,
}

struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

impl Activity {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// Outcome of [`ProviderEntry::acquire`].
pub(crate) enum Acquired {
    Ready(InFlightGuard),
    /// The entry was removed from the provider table; look it up again.
    Retired,
}

/// Cached runtime object for one provider.
pub struct ProviderEntry {
    key: ProviderKey,
    location: String,
    module: Arc<ModuleEntry>,
    state: Mutex<ProviderState>,
    /// Mirror of `state.status`, readable without the status lock.
    status: AtomicU8,
    in_flight: AtomicUsize,
    activity: Mutex<Activity>,
    quantum: AtomicU64,
    /// Failed initialization attempts.
    failures: AtomicU64,
    retired: AtomicBool,
}

impl ProviderEntry {
    pub(crate) fn new(key: ProviderKey, location: String, module: Arc<ModuleEntry>) -> Self {
        Self {
            key,
            location,
            module,
            state: Mutex::new(ProviderState {
                status: ProviderStatus::Uninitialized,
                instance: None,
                broker: None,
                last_failure: None,
            }),
            status: AtomicU8::new(ProviderStatus::Uninitialized as u8),
            in_flight: AtomicUsize::new(0),
            activity: Mutex::new(Activity::now()),
            quantum: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn module(&self) -> &Arc<ModuleEntry> {
        &self.module
    }

    pub fn status(&self) -> ProviderStatus {
        ProviderStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == ProviderStatus::Initialized
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Time since the last completed operation (or since creation).
    pub fn idle_for(&self) -> Duration {
        self.activity.lock().at.elapsed()
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.activity.lock().wall
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        *self.activity.lock() = Activity::now();
    }

    /// Claim this entry for sweep pass `generation`. False when the pass
    /// already looked at it.
    pub(crate) fn mark_quantum(&self, generation: u64) -> bool {
        self.quantum.fetch_max(generation, Ordering::AcqRel) < generation
    }

    fn set_status(&self, state: &mut ProviderState, status: ProviderStatus) {
        state.status = status;
        self.status.store(status as u8, Ordering::Release);
    }

    /// Bump the in-flight counter. Only called with the status lock held
    /// and the provider initialized.
    fn enter(self: &Arc<Self>, state: &ProviderState) -> Option<InFlightGuard> {
        let provider = Arc::clone(state.instance.as_ref()?);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(InFlightGuard {
            entry: Arc::clone(self),
            provider,
        })
    }

    fn enter_initialized(self: &Arc<Self>, state: &ProviderState) -> Result<Acquired, BrokerError> {
        self.enter(state).map(Acquired::Ready).ok_or_else(|| {
            BrokerError::Internal(format!("provider {} initialized without an instance", self.key))
        })
    }

    /// Take an in-flight reference, initializing the provider first if
    /// needed.
    ///
    /// `init` runs with the status lock held, so concurrent callers wait
    /// for it and re-check afterwards. A caller that waited through a
    /// failed attempt gets that failure instead of retrying.
    pub(crate) fn acquire<F>(self: &Arc<Self>, init: F) -> Result<Acquired, BrokerError>
    where
        F: FnOnce(&ProviderEntry) -> Result<(Arc<dyn Provider>, BrokerHandle), BrokerError>,
    {
        let seen = self.failures.load(Ordering::Acquire);
        let mut state = self.state.lock();

        if state.status == ProviderStatus::Initialized {
            return self.enter_initialized(&state);
        }
        if self.failures.load(Ordering::Acquire) != seen
            && let Some(ref failure) = state.last_failure
        {
            return Err(BrokerError::ProviderInitializationFailed(failure.clone()));
        }
        if self.is_retired() {
            return Ok(Acquired::Retired);
        }

        self.set_status(&mut state, ProviderStatus::Initializing);
        debug!(module = %self.key.module(), provider = %self.key.provider(), "Initializing provider");

        match init(&**self) {
            Ok((instance, broker)) => {
                state.instance = Some(instance);
                state.broker = Some(broker);
                state.last_failure = None;
                self.set_status(&mut state, ProviderStatus::Initialized);
                info!(module = %self.key.module(), provider = %self.key.provider(), "Provider initialized");
                self.touch();
                self.enter_initialized(&state)
            }
            Err(e) => {
                state.last_failure = Some(e.to_string());
                self.failures.fetch_add(1, Ordering::AcqRel);
                self.set_status(&mut state, ProviderStatus::Uninitialized);
                Err(e)
            }
        }
    }

    /// In-flight reference to an already initialized provider. Never
    /// initializes.
    pub fn try_enter(self: &Arc<Self>) -> Option<InFlightGuard> {
        let state = self.state.lock();
        if state.status != ProviderStatus::Initialized {
            return None;
        }
        self.enter(&state)
    }

    /// Terminate the provider and release its module.
    ///
    /// Without `force` a provider with operations in flight is left alone
    /// and `Busy` is returned. With `force` it is terminated anyway. A
    /// failing `terminate` still resets the entry; the failure is returned
    /// as `BrokerError::Terminate`.
    pub fn unload(&self, force: bool) -> Result<UnloadOutcome, BrokerError> {
        let mut state = self.state.lock();
        if state.status != ProviderStatus::Initialized {
            return Ok(UnloadOutcome::NotLoaded);
        }

        let busy = self.in_flight();
        if busy > 0 {
            if !force {
                return Ok(UnloadOutcome::Busy);
            }
            warn!(
                module = %self.key.module(),
                provider = %self.key.provider(),
                in_flight = busy,
                "Forcing unload with operations in flight"
            );
        }

        self.set_status(&mut state, ProviderStatus::Terminating);
        let result = match state.instance.take() {
            Some(instance) => guarded(|| instance.terminate()),
            None => Ok(()),
        };
        self.module.release();
        state.broker = None;
        self.set_status(&mut state, ProviderStatus::Uninitialized);
        drop(state);

        match result {
            Ok(()) => {
                info!(module = %self.key.module(), provider = %self.key.provider(), "Provider unloaded");
                Ok(UnloadOutcome::Unloaded)
            }
            Err(e) => {
                warn!(module = %self.key.module(), provider = %self.key.provider(), error = %e, "Provider terminate failed");
                Err(BrokerError::Terminate(self.key.to_string(), e))
            }
        }
    }

    /// Wait until no operations are in flight or `deadline` passes.
    pub fn wait_for_drain(&self, deadline: Instant, poll: Duration) -> bool {
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(poll.min(deadline - now));
        }
    }

    /// Mark removed if uninitialized and nobody holds the status lock.
    /// Called with the table lock held.
    pub(crate) fn try_retire(&self) -> bool {
        match self.state.try_lock() {
            Some(state) if state.status == ProviderStatus::Uninitialized => {
                self.retired.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Mark removed unconditionally. Teardown only.
    pub(crate) fn retire(&self) {
        let _state = self.state.lock();
        self.retired.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            module: self.key.module().to_string(),
            provider: self.key.provider().to_string(),
            location: self.location.clone(),
            status: self.status(),
            in_flight: self.in_flight(),
            last_used: self.last_used(),
            module_loaded: self.module.is_loaded(),
        }
    }
}

/// Holds a provider's in-flight counter raised. Dropping it lowers the
/// counter and restarts the idle timer.
pub struct InFlightGuard {
    entry: Arc<ProviderEntry>,
    provider: Arc<dyn Provider>,
}

impl InFlightGuard {
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn entry(&self) -> &Arc<ProviderEntry> {
        &self.entry
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.entry.touch();
        let prev = self.entry.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "in-flight counter underflow for {}", self.entry.key);
    }
}

/// Diagnostic snapshot of one provider entry.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub module: String,
    pub provider: String,
    pub location: String,
    pub status: ProviderStatus,
    pub in_flight: usize,
    pub last_used: DateTime<Utc>,
    pub module_loaded: bool,
}
