use figment::{Figment, providers::{Env, Format, Yaml}};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub provider_manager: ProviderManagerConfig,
    #[serde(default)]
    pub housekeeping: HousekeepingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,
    #[serde(default = "default_initial_size")]
    pub initial_size: usize,
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,
    /// Upper bound on live workers. 0 = unbounded.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Idle workers older than this are reclaimed by `reap_idle`. 0 = never.
    #[serde(default = "default_idle_deallocation")]
    pub idle_deallocation_secs: u64,
}

/// Provider lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManagerConfig {
    /// Providers unused for longer than this are unloaded by the idle sweep.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// How long a module disable waits for in-flight operations to drain.
    #[serde(default = "default_disable_timeout")]
    pub disable_timeout_secs: u64,
    #[serde(default = "default_disable_poll_interval")]
    pub disable_poll_interval_ms: u64,
    /// Unload providers concurrently on the worker pool during shutdown.
    #[serde(default = "default_true")]
    pub parallel_shutdown: bool,
    /// Bounded wait for in-flight operations before a forced shutdown unload.
    /// 0 = force immediately.
    #[serde(default)]
    pub shutdown_drain_timeout_ms: u64,
}

/// Background idle sweep + pool reaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_housekeeping_interval")]
    pub interval_secs: u64,
}

/// Observability settings. Disabled by default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// When false, no prometheus counters are updated on the dispatch path.
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

// ── Defaults ──────────────────────────────────────────────────

fn default_pool_name() -> String { "provider-pool".into() }
fn default_initial_size() -> usize { 4 }
fn default_min_threads() -> usize { 2 }
fn default_max_threads() -> usize { 16 }
fn default_idle_deallocation() -> u64 { 300 }
fn default_idle_timeout() -> u64 { 300 }
fn default_disable_timeout() -> u64 { 15 }
fn default_disable_poll_interval() -> u64 { 1000 }
fn default_housekeeping_interval() -> u64 { 30 }
fn default_true() -> bool { true }

// ── Impls ─────────────────────────────────────────────────────

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            provider_manager: ProviderManagerConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            observability: ObservabilityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            initial_size: default_initial_size(),
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            idle_deallocation_secs: default_idle_deallocation(),
        }
    }
}

impl Default for ProviderManagerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            disable_timeout_secs: default_disable_timeout(),
            disable_poll_interval_ms: default_disable_poll_interval(),
            parallel_shutdown: true,
            shutdown_drain_timeout_ms: 0,
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_housekeeping_interval(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from YAML file + env overrides.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config: BrokerConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("BROKER_").split("__"))
            .extract()?;
        Ok(config)
    }
}

impl PoolConfig {
    /// Apply the sizing rules: a bounded `max_threads` is raised to at
    /// least `initial_size`, and `min_threads` never exceeds `initial_size`.
    pub fn normalized(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.max_threads > 0 && cfg.max_threads < cfg.initial_size {
            cfg.max_threads = cfg.initial_size;
        }
        if cfg.min_threads > cfg.initial_size {
            cfg.min_threads = cfg.initial_size;
        }
        cfg
    }

    /// `None` when idle reaping is disabled.
    pub fn idle_deallocation(&self) -> Option<Duration> {
        (self.idle_deallocation_secs > 0).then(|| Duration::from_secs(self.idle_deallocation_secs))
    }
}

impl ProviderManagerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn disable_timeout(&self) -> Duration {
        Duration::from_secs(self.disable_timeout_secs)
    }

    pub fn disable_poll_interval(&self) -> Duration {
        Duration::from_millis(self.disable_poll_interval_ms.max(1))
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }
}

impl HousekeepingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── Default values ────────────────────────────────────────────

    #[test]
    fn default_pool_config_has_expected_values() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.name, "provider-pool");
        assert_eq!(cfg.initial_size, 4);
        assert_eq!(cfg.min_threads, 2);
        assert_eq!(cfg.max_threads, 16);
        assert_eq!(cfg.idle_deallocation_secs, 300);
    }

    #[test]
    fn default_provider_manager_config_has_expected_values() {
        let cfg = ProviderManagerConfig::default();
        assert_eq!(cfg.idle_timeout_secs, 300);
        assert_eq!(cfg.disable_timeout_secs, 15);
        assert_eq!(cfg.disable_poll_interval_ms, 1000);
        assert!(cfg.parallel_shutdown);
        assert_eq!(cfg.shutdown_drain_timeout(), Duration::ZERO);
    }

    #[test]
    fn default_observability_disabled() {
        let cfg = BrokerConfig::default();
        assert!(!cfg.observability.prometheus.enabled);
        assert!(!cfg.logging.json);
        assert!(cfg.housekeeping.enabled);
    }

    // ── normalized() ──────────────────────────────────────────────

    #[test]
    fn normalized_raises_max_to_initial_size() {
        let cfg = PoolConfig { initial_size: 8, max_threads: 3, ..PoolConfig::default() };
        assert_eq!(cfg.normalized().max_threads, 8);
    }

    #[test]
    fn normalized_keeps_unbounded_max() {
        let cfg = PoolConfig { initial_size: 8, max_threads: 0, ..PoolConfig::default() };
        assert_eq!(cfg.normalized().max_threads, 0);
    }

    #[test]
    fn normalized_caps_min_at_initial_size() {
        let cfg = PoolConfig { initial_size: 2, min_threads: 5, ..PoolConfig::default() };
        assert_eq!(cfg.normalized().min_threads, 2);
    }

    #[test]
    fn zero_idle_deallocation_means_never() {
        let cfg = PoolConfig { idle_deallocation_secs: 0, ..PoolConfig::default() };
        assert!(cfg.idle_deallocation().is_none());
        assert_eq!(PoolConfig::default().idle_deallocation(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn poll_interval_is_never_zero() {
        let cfg = ProviderManagerConfig { disable_poll_interval_ms: 0, ..Default::default() };
        assert_eq!(cfg.disable_poll_interval(), Duration::from_millis(1));
    }

    // ── BrokerConfig::load() ──────────────────────────────────────

    #[test]
    fn load_from_valid_yaml_overrides_defaults() {
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "pool:\n  initial_size: 6\n  max_threads: 12\n").unwrap();
        let cfg = BrokerConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.pool.initial_size, 6);
        assert_eq!(cfg.pool.max_threads, 12);
        // Defaults still apply for unspecified fields
        assert_eq!(cfg.pool.min_threads, 2);
        assert_eq!(cfg.provider_manager.idle_timeout_secs, 300);
    }

    #[test]
    fn load_yaml_with_manager_and_observability() {
        let yaml = r#"
provider_manager:
  idle_timeout_secs: 60
  disable_timeout_secs: 3
  parallel_shutdown: false
  shutdown_drain_timeout_ms: 250
housekeeping:
  interval_secs: 5
observability:
  prometheus:
    enabled: true
logging:
  json: true
"#;
        let mut tmpfile = tempfile::NamedTempFile::new().unwrap();
        write!(tmpfile, "{yaml}").unwrap();
        let cfg = BrokerConfig::load(tmpfile.path()).unwrap();
        assert_eq!(cfg.provider_manager.idle_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.provider_manager.disable_timeout(), Duration::from_secs(3));
        assert!(!cfg.provider_manager.parallel_shutdown);
        assert_eq!(cfg.provider_manager.shutdown_drain_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.housekeeping.interval(), Duration::from_secs(5));
        assert!(cfg.observability.prometheus.enabled);
        assert!(cfg.logging.json);
    }

    #[test]
    fn default_config_survives_yaml_roundtrip() {
        let yaml = serde_yaml::to_string(&BrokerConfig::default()).unwrap();
        let cfg: BrokerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.pool.name, "provider-pool");
        assert_eq!(cfg.provider_manager.disable_timeout_secs, 15);
    }
}
