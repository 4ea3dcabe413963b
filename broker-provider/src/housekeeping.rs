use crossbeam_channel::{RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

use crate::manager::ProviderManager;

/// Background thread running the provider idle sweep and pool reaping on
/// a fixed interval. Stopped explicitly and joined; also on drop.
pub struct Housekeeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn start(manager: Arc<ProviderManager>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("broker-housekeeper".into())
            .spawn(move || {
                info!(interval_ms = interval.as_millis() as u64, "Housekeeper started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let report = manager.run_housekeeping();
                            if report.providers_unloaded > 0 || report.threads_reaped > 0 {
                                debug!(
                                    providers = report.providers_unloaded,
                                    threads = report.threads_reaped,
                                    "Housekeeping pass"
                                );
                            }
                        }
                        // Stop requested or the handle was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("Housekeeper stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("Housekeeper thread panicked");
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
