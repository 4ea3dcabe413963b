// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Object broker: provider manager host
//
//  Worker pool:   bounded OS threads, reaped when idle
//  Providers:     lazily loaded, idle-swept, drained on shutdown
//  Config:        YAML + BROKER_ environment overrides
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use broker_core::BrokerConfig;
use broker_observability::MetricsCollector;
use broker_pool::ThreadPool;
use broker_provider::{Housekeeper, InProcessLoader, ProviderManager};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "broker", version, about = "Object broker provider manager")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/broker/broker.yaml")]
    config: PathBuf,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines regardless of the config file
    #[arg(long)]
    json_logs: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Config ──
    let config_found = cli.config.exists();
    let config = if config_found {
        BrokerConfig::load(&cli.config)?
    } else {
        BrokerConfig::default()
    };

    // ── Tracing ──
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    if cli.json_logs || config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Object broker starting");
    if config_found {
        info!(path = %cli.config.display(), "Loaded config file");
    } else {
        info!("No config file found, using defaults");
    }

    // ── Metrics ──
    let metrics = Arc::new(MetricsCollector::new(config.observability.prometheus.enabled)?);

    // ── Worker pool ──
    let pool = Arc::new(ThreadPool::from_config(&config.pool)?);

    // ── Provider manager ──
    // Embedding applications register their provider modules on the loader.
    let loader = Arc::new(InProcessLoader::new());
    let manager = Arc::new(ProviderManager::new(
        config.provider_manager.clone(),
        loader,
        Arc::clone(&pool),
        Arc::clone(&metrics),
    ));

    // ── Housekeeping ──
    let housekeeper = if config.housekeeping.enabled {
        Some(Housekeeper::start(
            Arc::clone(&manager),
            config.housekeeping.interval(),
        )?)
    } else {
        None
    };

    info!(
        pool = %pool.name(),
        threads = pool.current_threads(),
        max_threads = pool.max_threads(),
        "Object broker is ready"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("Shutdown signal received, stopping...");

    // Housekeeping first so no sweep races the provider shutdown.
    if let Some(housekeeper) = housekeeper {
        housekeeper.stop();
    }

    let report = manager.teardown();
    info!(
        attempted = report.attempted,
        unloaded = report.unloaded,
        failed = report.failed,
        "Providers stopped"
    );
    if let Some(ref e) = report.first_error {
        tracing::warn!(error = %e, "First provider shutdown error");
    }

    drop(manager);
    pool.shutdown();

    if metrics.is_enabled() {
        tracing::debug!(metrics = %metrics.render(), "Final metrics");
    }

    info!("Object broker stopped");
    Ok(())
}

fn setup_signal_handler() {
    // SIGTERM (service stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
