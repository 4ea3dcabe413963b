use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Why a provider was unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadReason {
    Idle,
    Disable,
    Explicit,
    Shutdown,
}

impl UnloadReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnloadReason::Idle => "idle",
            UnloadReason::Disable => "disable",
            UnloadReason::Explicit => "explicit",
            UnloadReason::Shutdown => "shutdown",
        }
    }
}

/// Broker metrics. Every recorder is a no-op when disabled.
///
/// When `enabled = false` no registry is created and every field is `None`,
/// so the dispatch path pays a single branch.
pub struct MetricsCollector {
    enabled: bool,
    registry: Option<Registry>,
    pub dispatch_total: Option<IntCounterVec>,
    pub dispatch_duration: Option<HistogramVec>,
    pub provider_loads_total: Option<IntCounterVec>,
    pub provider_unloads_total: Option<IntCounterVec>,
    pub provider_init_failures_total: Option<IntCounterVec>,
    pub active_providers: Option<IntGauge>,
    pub pool_threads: Option<IntGaugeVec>,
}

impl MetricsCollector {
    pub fn new(enabled: bool) -> anyhow::Result<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }

        let registry = Registry::new();

        let dispatch_total = IntCounterVec::new(
            Opts::new("dispatch_total", "Provider operations dispatched").namespace("broker"),
            &["module", "provider", "outcome"],
        )?;

        let dispatch_duration = HistogramVec::new(
            HistogramOpts::new("dispatch_duration_seconds", "Provider operation latency")
                .namespace("broker")
                .buckets(vec![
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0,
                ]),
            &["module"],
        )?;

        let provider_loads_total = IntCounterVec::new(
            Opts::new("provider_loads_total", "Providers loaded and initialized")
                .namespace("broker"),
            &["module", "provider"],
        )?;

        let provider_unloads_total = IntCounterVec::new(
            Opts::new("provider_unloads_total", "Providers unloaded").namespace("broker"),
            &["module", "provider", "reason"],
        )?;

        let provider_init_failures_total = IntCounterVec::new(
            Opts::new(
                "provider_init_failures_total",
                "Provider load or initialize failures",
            )
            .namespace("broker"),
            &["module", "provider"],
        )?;

        let active_providers = IntGauge::with_opts(
            Opts::new("active_providers", "Initialized providers").namespace("broker"),
        )?;

        let pool_threads = IntGaugeVec::new(
            Opts::new("pool_threads", "Worker threads by state").namespace("broker"),
            &["pool", "state"],
        )?;

        registry.register(Box::new(dispatch_total.clone()))?;
        registry.register(Box::new(dispatch_duration.clone()))?;
        registry.register(Box::new(provider_loads_total.clone()))?;
        registry.register(Box::new(provider_unloads_total.clone()))?;
        registry.register(Box::new(provider_init_failures_total.clone()))?;
        registry.register(Box::new(active_providers.clone()))?;
        registry.register(Box::new(pool_threads.clone()))?;

        tracing::debug!("Prometheus metrics registered");

        Ok(Self {
            enabled: true,
            registry: Some(registry),
            dispatch_total: Some(dispatch_total),
            dispatch_duration: Some(dispatch_duration),
            provider_loads_total: Some(provider_loads_total),
            provider_unloads_total: Some(provider_unloads_total),
            provider_init_failures_total: Some(provider_init_failures_total),
            active_providers: Some(active_providers),
            pool_threads: Some(pool_threads),
        })
    }

    /// A collector that records nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            registry: None,
            dispatch_total: None,
            dispatch_duration: None,
            provider_loads_total: None,
            provider_unloads_total: None,
            provider_init_failures_total: None,
            active_providers: None,
            pool_threads: None,
        }
    }

    #[inline]
    pub fn record_dispatch(&self, module: &str, provider: &str, ok: bool, duration_secs: f64) {
        if !self.enabled {
            return;
        }
        if let Some(ref counter) = self.dispatch_total {
            let outcome = if ok { "ok" } else { "error" };
            counter.with_label_values(&[module, provider, outcome]).inc();
        }
        if let Some(ref hist) = self.dispatch_duration {
            hist.with_label_values(&[module]).observe(duration_secs);
        }
    }

    pub fn record_load(&self, module: &str, provider: &str) {
        if let Some(ref counter) = self.provider_loads_total {
            counter.with_label_values(&[module, provider]).inc();
        }
        if let Some(ref gauge) = self.active_providers {
            gauge.inc();
        }
    }

    pub fn record_unload(&self, module: &str, provider: &str, reason: UnloadReason) {
        if let Some(ref counter) = self.provider_unloads_total {
            counter
                .with_label_values(&[module, provider, reason.as_str()])
                .inc();
        }
        if let Some(ref gauge) = self.active_providers {
            gauge.dec();
        }
    }

    pub fn record_init_failure(&self, module: &str, provider: &str) {
        if let Some(ref counter) = self.provider_init_failures_total {
            counter.with_label_values(&[module, provider]).inc();
        }
    }

    pub fn set_pool_threads(&self, pool: &str, idle: usize, running: usize) {
        if let Some(ref gauge) = self.pool_threads {
            gauge.with_label_values(&[pool, "idle"]).set(idle as i64);
            gauge.with_label_values(&[pool, "running"]).set(running as i64);
        }
    }

    /// Render prometheus text exposition format.
    pub fn render(&self) -> String {
        if let Some(ref registry) = self.registry {
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            let mut buffer = Vec::new();
            encoder.encode(&metric_families, &mut buffer).unwrap_or(());
            String::from_utf8(buffer).unwrap_or_default()
        } else {
            String::new()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Disabled collector ───────────────────────────────────────

    #[test]
    fn disabled_collector_has_no_fields() {
        let mc = MetricsCollector::new(false).unwrap();
        assert!(!mc.is_enabled());
        assert!(mc.dispatch_total.is_none());
        assert!(mc.active_providers.is_none());
        assert!(mc.pool_threads.is_none());
        assert_eq!(mc.render(), "");
    }

    #[test]
    fn disabled_collector_recorders_are_noops() {
        let mc = MetricsCollector::disabled();
        mc.record_dispatch("m", "p", true, 0.001);
        mc.record_load("m", "p");
        mc.record_unload("m", "p", UnloadReason::Idle);
        mc.record_init_failure("m", "p");
        mc.set_pool_threads("pool", 1, 2);
    }

    // ── Enabled collector ────────────────────────────────────────

    #[test]
    fn dispatch_outcomes_are_counted_separately() {
        let mc = MetricsCollector::new(true).unwrap();
        mc.record_dispatch("OSModule", "OSProvider", true, 0.01);
        mc.record_dispatch("OSModule", "OSProvider", true, 0.02);
        mc.record_dispatch("OSModule", "OSProvider", false, 0.03);

        let counter = mc.dispatch_total.as_ref().unwrap();
        assert_eq!(
            counter.with_label_values(&["OSModule", "OSProvider", "ok"]).get(),
            2
        );
        assert_eq!(
            counter.with_label_values(&["OSModule", "OSProvider", "error"]).get(),
            1
        );
    }

    #[test]
    fn loads_and_unloads_track_active_gauge() {
        let mc = MetricsCollector::new(true).unwrap();
        mc.record_load("m", "a");
        mc.record_load("m", "b");
        mc.record_unload("m", "a", UnloadReason::Shutdown);

        assert_eq!(mc.active_providers.as_ref().unwrap().get(), 1);
        let unloads = mc.provider_unloads_total.as_ref().unwrap();
        assert_eq!(unloads.with_label_values(&["m", "a", "shutdown"]).get(), 1);
    }

    #[test]
    fn unload_reason_labels() {
        let labels: Vec<_> = [
            UnloadReason::Idle,
            UnloadReason::Disable,
            UnloadReason::Explicit,
            UnloadReason::Shutdown,
        ]
        .iter()
        .map(|r| r.as_str())
        .collect();
        assert_eq!(labels, ["idle", "disable", "explicit", "shutdown"]);
    }

    #[test]
    fn pool_gauges_and_render() {
        let mc = MetricsCollector::new(true).unwrap();
        mc.set_pool_threads("provider-pool", 3, 1);
        mc.record_init_failure("m", "p");

        let output = mc.render();
        assert!(output.contains("broker_pool_threads"));
        assert!(output.contains("broker_provider_init_failures_total"));
        assert!(output.contains("state=\"idle\""));
    }
}
