use broker_core::config::ProviderManagerConfig;
use broker_core::{
    BrokerError, BrokerHandle, BrokerMessage, BrokerResponse, CimException, ModuleLoader,
    ModuleOperationalStatus, OperationRequest, OperationResponse, Provider, ProviderKey,
    ProviderName,
};
use broker_observability::{MetricsCollector, UnloadReason};
use broker_pool::{PoolError, ThreadPool};
use crossbeam_channel::Sender;
use dashmap::DashSet;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::entry::{Acquired, InFlightGuard, ProviderEntry, ProviderStats, UnloadOutcome};
use crate::guarded;
use crate::registry::ProviderRegistry;

/// Result of [`ProviderManager::shutdown_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Initialized providers an unload was attempted on.
    pub attempted: usize,
    /// Providers reset to uninitialized, including ones whose terminate failed.
    pub unloaded: usize,
    /// Providers whose terminate failed.
    pub failed: usize,
    pub first_error: Option<String>,
}

impl ShutdownReport {
    fn tally(&mut self, result: &Result<UnloadOutcome, BrokerError>) {
        match result {
            Ok(UnloadOutcome::Unloaded) => self.unloaded += 1,
            Ok(_) => {}
            Err(e) => {
                self.unloaded += 1;
                self.failed += 1;
                if self.first_error.is_none() {
                    self.first_error = Some(e.to_string());
                }
            }
        }
    }
}

/// Result of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub providers_unloaded: usize,
    pub threads_reaped: usize,
}

/// Dispatch and lifecycle engine for provider modules.
///
/// Owns the module/provider tables. Operations are routed to lazily
/// initialized providers; disable, idle sweep and shutdown unload them
/// without ever unloading one with operations in flight, except for the
/// forced shutdown path.
pub struct ProviderManager {
    registry: ProviderRegistry,
    pool: Arc<ThreadPool>,
    metrics: Arc<MetricsCollector>,
    config: ProviderManagerConfig,
    /// Logical module names refusing new operations.
    disabled: DashSet<String>,
    subscriptions_initialized: AtomicBool,
    sweep_generation: AtomicU64,
    torn_down: AtomicBool,
}

impl ProviderManager {
    pub fn new(
        config: ProviderManagerConfig,
        loader: Arc<dyn ModuleLoader>,
        pool: Arc<ThreadPool>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        info!(
            idle_timeout_secs = config.idle_timeout_secs,
            disable_timeout_secs = config.disable_timeout_secs,
            parallel_shutdown = config.parallel_shutdown,
            "Provider manager created"
        );
        Self {
            registry: ProviderRegistry::new(loader),
            pool,
            metrics,
            config,
            disabled: DashSet::new(),
            subscriptions_initialized: AtomicBool::new(false),
            sweep_generation: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &ProviderManagerConfig {
        &self.config
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Route one operation to its provider. Provider failures (typed,
    /// generic or panics) come back inside the response.
    pub fn handle(&self, request: &OperationRequest) -> OperationResponse {
        let started = Instant::now();
        let result = self.dispatch(request);

        let name = &request.provider;
        self.metrics.record_dispatch(
            &name.module_name,
            &name.provider_name,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );
        trace!(
            message_id = %request.message_id,
            module = %name.module_name,
            provider = %name.provider_name,
            kind = %request.kind,
            ok = result.is_ok(),
            "Operation dispatched"
        );
        request.respond(result)
    }

    fn dispatch(&self, request: &OperationRequest) -> Result<Value, CimException> {
        let guard = self.acquire(&request.provider).map_err(|e| {
            debug!(module = %request.provider.module_name, provider = %request.provider.provider_name, error = %e, "Provider unavailable");
            e.to_cim()
        })?;

        let provider = Arc::clone(guard.provider());
        let result = guarded(|| provider.handle(request));
        drop(guard);

        result.map_err(|e| {
            debug!(
                module = %request.provider.module_name,
                provider = %request.provider.provider_name,
                error = %e,
                "Provider operation failed"
            );
            e.into_cim()
        })
    }

    /// Resolve `name` to an initialized provider with its in-flight counter
    /// raised.
    pub fn acquire(&self, name: &ProviderName) -> Result<InFlightGuard, BrokerError> {
        loop {
            self.check_accepting(&name.module_name)?;
            let entry = self.registry.lookup_or_create_provider(name);
            match entry.acquire(|e| self.initialize(e)) {
                Ok(Acquired::Ready(guard)) => return Ok(guard),
                // Removed from the table while we waited; look it up again.
                Ok(Acquired::Retired) => continue,
                Err(e) => {
                    self.registry.remove_if_uninitialized(&entry);
                    return Err(e);
                }
            }
        }
    }

    fn check_accepting(&self, module: &str) -> Result<(), BrokerError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(BrokerError::ShuttingDown);
        }
        if self.disabled.contains(module) {
            return Err(BrokerError::ModuleDisabled(module.to_string()));
        }
        Ok(())
    }

    /// Load and initialize. Runs under the entry's status lock.
    fn initialize(
        &self,
        entry: &ProviderEntry,
    ) -> Result<(Arc<dyn Provider>, BrokerHandle), BrokerError> {
        let key = entry.key();
        // The caller's first check may predate a disable or teardown.
        self.check_accepting(key.module())?;
        if entry.location().is_empty() {
            self.metrics.record_init_failure(key.module(), key.provider());
            return Err(BrokerError::EmptyLibraryName(key.to_string()));
        }

        let module = entry.module();
        let instance = module.load_provider(key.provider()).map_err(|source| {
            self.metrics.record_init_failure(key.module(), key.provider());
            error!(module = %key.module(), provider = %key.provider(), error = %source, "Provider load failed");
            BrokerError::ProviderLoad {
                module: key.module().to_string(),
                provider: key.provider().to_string(),
                source,
            }
        })?;

        let broker = BrokerHandle::new(key.clone());
        if let Err(source) = guarded(|| instance.initialize(&broker)) {
            // Drop the broker handle and the module reference we took.
            drop(broker);
            module.release();
            self.metrics.record_init_failure(key.module(), key.provider());
            error!(module = %key.module(), provider = %key.provider(), error = %source, "Provider initialize failed");
            return Err(BrokerError::ProviderInitialize {
                provider: key.to_string(),
                source,
            });
        }

        if self.subscriptions_initialized.load(Ordering::Acquire)
            && let Err(e) = guarded(|| {
                instance.subscription_init_complete();
                Ok(())
            })
        {
            warn!(module = %key.module(), provider = %key.provider(), error = %e, "subscription_init_complete failed");
        }

        self.metrics.record_load(key.module(), key.provider());
        Ok((instance, broker))
    }

    /// Run [`ProviderManager::handle`] on a pooled worker and send the
    /// response to `reply`. A pool refusal is returned to the caller.
    pub fn dispatch_async(
        self: &Arc<Self>,
        request: OperationRequest,
        reply: Sender<OperationResponse>,
    ) -> Result<(), PoolError> {
        let manager = Arc::clone(self);
        self.pool.submit(
            move || {
                let response = manager.handle(&request);
                if reply.send(response).is_err() {
                    debug!(message_id = %request.message_id, "Response receiver gone");
                }
            },
            None,
        )
    }

    /// Message-level entry point for the hosting server.
    pub fn process(&self, message: BrokerMessage) -> BrokerResponse {
        match message {
            BrokerMessage::Operation(request) => BrokerResponse::Operation(self.handle(&request)),
            BrokerMessage::DisableModule { module, providers } => {
                BrokerResponse::ModuleStatus(vec![self.disable_module(&module, &providers)])
            }
            BrokerMessage::EnableModule { module } => {
                BrokerResponse::ModuleStatus(vec![self.enable_module(&module)])
            }
            BrokerMessage::StopAllProviders => {
                let report = self.shutdown_all();
                if let Some(ref e) = report.first_error {
                    warn!(failed = report.failed, first_error = %e, "Stop all providers finished with errors");
                }
                BrokerResponse::Ack
            }
            BrokerMessage::SubscriptionInitComplete => {
                self.subscription_init_complete();
                BrokerResponse::Ack
            }
            BrokerMessage::IndicationServiceDisabled => {
                self.indication_service_disabled();
                BrokerResponse::Ack
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Unload `providers` of `module` (all of its providers in the table
    /// when empty), waiting a bounded time for each to drain.
    ///
    /// Returns `Stopped` when every provider was unloaded. If one could not
    /// be drained in time the module stays enabled and `Ok` is returned;
    /// nothing is forcibly terminated.
    pub fn disable_module(&self, module: &str, providers: &[String]) -> ModuleOperationalStatus {
        info!(module, "Disabling provider module");
        let newly_disabled = self.disabled.insert(module.to_string());

        let entries: Vec<_> = self
            .registry
            .snapshot_module(module)
            .into_iter()
            .filter(|e| providers.is_empty() || providers.iter().any(|p| p == e.key().provider()))
            .collect();

        let deadline = Instant::now() + self.config.disable_timeout();
        let poll = self.config.disable_poll_interval();
        let mut drained = true;

        for entry in &entries {
            loop {
                match self.unload_entry(entry, false, UnloadReason::Disable) {
                    UnloadOutcome::Busy => {
                        let now = Instant::now();
                        if now >= deadline {
                            warn!(
                                module,
                                provider = %entry.key().provider(),
                                in_flight = entry.in_flight(),
                                "Provider still busy, disable abandoned"
                            );
                            drained = false;
                            break;
                        }
                        std::thread::sleep(poll.min(deadline - now));
                    }
                    UnloadOutcome::Unloaded | UnloadOutcome::NotLoaded => break,
                }
            }
            if !drained {
                break;
            }
        }

        if drained {
            info!(module, providers = entries.len(), "Provider module disabled");
            ModuleOperationalStatus::Stopped
        } else {
            if newly_disabled {
                self.disabled.remove(module);
            }
            ModuleOperationalStatus::Ok
        }
    }

    /// Accept operations for `module` again. Providers reload lazily.
    pub fn enable_module(&self, module: &str) -> ModuleOperationalStatus {
        if self.disabled.remove(module).is_some() {
            info!(module, "Provider module enabled");
        }
        ModuleOperationalStatus::Ok
    }

    pub fn is_module_disabled(&self, module: &str) -> bool {
        self.disabled.contains(module)
    }

    /// Unload one provider unless it is busy.
    pub fn unload_provider(&self, module: &str, provider: &str) -> Result<UnloadOutcome, BrokerError> {
        let Some(entry) = self.registry.get_provider(&ProviderKey::new(module, provider)) else {
            return Ok(UnloadOutcome::NotLoaded);
        };
        let result = entry.unload(false);
        self.after_unload(&entry, &result, UnloadReason::Explicit);
        result
    }

    /// Unload every initialized provider, forcing past in-flight work.
    ///
    /// Each provider first gets up to `shutdown_drain_timeout` to drain.
    /// With `parallel_shutdown` the unloads run on the pool, falling back
    /// to the calling thread when the pool refuses. Failures are counted
    /// and never stop the sweep.
    pub fn shutdown_all(&self) -> ShutdownReport {
        let entries: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|e| e.is_initialized())
            .collect();

        let mut report = ShutdownReport {
            attempted: entries.len(),
            ..ShutdownReport::default()
        };
        if entries.is_empty() {
            return report;
        }
        info!(providers = entries.len(), "Shutting down all providers");

        let drain = self.config.shutdown_drain_timeout();
        if !drain.is_zero() {
            let deadline = Instant::now() + drain;
            for entry in &entries {
                if !entry.wait_for_drain(deadline, Duration::from_millis(5)) {
                    warn!(
                        module = %entry.key().module(),
                        provider = %entry.key().provider(),
                        in_flight = entry.in_flight(),
                        "Provider did not drain before shutdown"
                    );
                }
            }
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        for entry in &entries {
            if self.config.parallel_shutdown {
                let job = {
                    let entry = Arc::clone(entry);
                    let tx = tx.clone();
                    move || {
                        let result = entry.unload(true);
                        let _ = tx.send((entry, result));
                    }
                };
                match self.pool.submit(job, None) {
                    Ok(()) => continue,
                    Err(e) => debug!(error = %e, "Pool refused shutdown task, unloading inline"),
                }
            }
            let _ = tx.send((Arc::clone(entry), entry.unload(true)));
        }
        drop(tx);

        for (entry, result) in rx.iter() {
            report.tally(&result);
            self.after_unload(&entry, &result, UnloadReason::Shutdown);
        }

        info!(
            attempted = report.attempted,
            unloaded = report.unloaded,
            failed = report.failed,
            "Provider shutdown complete"
        );
        report
    }

    /// Unload initialized providers idle longer than `idle_timeout` with
    /// nothing in flight. Returns how many were unloaded.
    pub fn idle_sweep(&self) -> usize {
        let timeout = self.config.idle_timeout();
        if timeout.is_zero() {
            return 0;
        }

        let generation = self.sweep_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut unloaded = 0;
        for entry in self.registry.snapshot() {
            if !entry.is_initialized() || !entry.mark_quantum(generation) {
                continue;
            }
            if entry.in_flight() > 0 || entry.idle_for() <= timeout {
                continue;
            }
            trace!(module = %entry.key().module(), provider = %entry.key().provider(), "Idle provider");
            if self.unload_entry(&entry, false, UnloadReason::Idle) == UnloadOutcome::Unloaded {
                unloaded += 1;
            }
        }

        if unloaded > 0 {
            info!(unloaded, "Idle providers unloaded");
        }
        unloaded
    }

    /// One housekeeping pass: idle sweep, pool reaping, pool gauges.
    pub fn run_housekeeping(&self) -> HousekeepingReport {
        let report = HousekeepingReport {
            providers_unloaded: self.idle_sweep(),
            threads_reaped: self.pool.reap_idle(),
        };
        self.metrics.set_pool_threads(
            self.pool.name(),
            self.pool.idle_count(),
            self.pool.running_count(),
        );
        report
    }

    /// Non-forced unload plus table cleanup. Terminate failures are logged
    /// and count as unloaded.
    fn unload_entry(
        &self,
        entry: &Arc<ProviderEntry>,
        force: bool,
        reason: UnloadReason,
    ) -> UnloadOutcome {
        let result = entry.unload(force);
        self.after_unload(entry, &result, reason);
        match result {
            Ok(outcome) => outcome,
            Err(_) => UnloadOutcome::Unloaded,
        }
    }

    fn after_unload(
        &self,
        entry: &Arc<ProviderEntry>,
        result: &Result<UnloadOutcome, BrokerError>,
        reason: UnloadReason,
    ) {
        match result {
            Ok(UnloadOutcome::Busy) => return,
            Ok(UnloadOutcome::Unloaded) | Err(_) => {
                self.metrics
                    .record_unload(entry.key().module(), entry.key().provider(), reason);
            }
            Ok(UnloadOutcome::NotLoaded) => {}
        }
        self.registry.remove_if_uninitialized(entry);
    }

    // ── Notifications ────────────────────────────────────────────

    /// Forward to initialized providers and remember it for providers
    /// initialized later.
    pub fn subscription_init_complete(&self) {
        self.subscriptions_initialized.store(true, Ordering::Release);
        self.notify("subscription_init_complete", |p| p.subscription_init_complete());
    }

    pub fn indication_service_disabled(&self) {
        self.subscriptions_initialized.store(false, Ordering::Release);
        self.notify("indication_service_disabled", |p| p.indication_service_disabled());
    }

    pub fn is_subscription_init_complete(&self) -> bool {
        self.subscriptions_initialized.load(Ordering::Acquire)
    }

    /// Call `f` on every initialized provider. Never initializes one.
    fn notify(&self, what: &str, f: impl Fn(&dyn Provider)) {
        for entry in self.registry.snapshot() {
            let Some(guard) = entry.try_enter() else {
                continue;
            };
            if let Err(e) = guarded(|| {
                f(&**guard.provider());
                Ok(())
            }) {
                warn!(module = %entry.key().module(), provider = %entry.key().provider(), error = %e, "{what} failed");
            }
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    pub fn has_active_providers(&self) -> bool {
        self.registry.snapshot().iter().any(|e| e.is_initialized())
    }

    pub fn is_provider_active(&self, key: &ProviderKey) -> bool {
        self.registry
            .get_provider(key)
            .is_some_and(|e| e.is_initialized())
    }

    /// Per-provider snapshot ordered by key.
    pub fn stats(&self) -> Vec<ProviderStats> {
        let mut entries = self.registry.snapshot();
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        entries.iter().map(|e| e.stats()).collect()
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Refuse new operations, unload every provider, then every module,
    /// and empty the tables. Idempotent; also run on drop.
    ///
    /// Providers still initializing when teardown starts are waited for
    /// and terminated like the rest.
    pub fn teardown(&self) -> ShutdownReport {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        let mut report = self.shutdown_all();

        let (providers, modules) = self.registry.drain();
        let deadline = Instant::now() + self.config.shutdown_drain_timeout();
        for entry in &providers {
            // Blocks until any initialization in progress has finished.
            entry.retire();
            if !entry.is_initialized() {
                continue;
            }
            report.attempted += 1;
            entry.wait_for_drain(deadline, Duration::from_millis(5));
            let result = entry.unload(true);
            report.tally(&result);
            if !matches!(result, Ok(UnloadOutcome::Busy | UnloadOutcome::NotLoaded)) {
                self.metrics
                    .record_unload(entry.key().module(), entry.key().provider(), UnloadReason::Shutdown);
            }
        }
        for module in &modules {
            module.force_unload();
        }
        debug!(providers = providers.len(), modules = modules.len(), "Provider manager torn down");
        report
    }
}

impl Drop for ProviderManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
