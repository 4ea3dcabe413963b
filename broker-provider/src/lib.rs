//! Provider lifecycle engine.
//!
//! Two identity-keyed tables (modules and providers) behind one table
//! lock, a per-provider state machine behind its own status lock, and the
//! [`ProviderManager`] that drives dispatch, disable, idle sweep and
//! shutdown over them.
//!
//! Lock order: the table lock may enclose a status lock, never the reverse.

pub mod entry;
pub mod housekeeping;
pub mod loader;
pub mod manager;
pub mod module;
pub mod registry;

pub use entry::{InFlightGuard, ProviderEntry, ProviderStats, ProviderStatus, UnloadOutcome};
pub use housekeeping::Housekeeper;
pub use loader::{InProcessLoader, InProcessModule};
pub use manager::{HousekeepingReport, ProviderManager, ShutdownReport};
pub use module::ModuleEntry;
pub use registry::ProviderRegistry;

use broker_core::ProviderError;
use broker_core::error::panic_message;
use std::panic::{self, AssertUnwindSafe};

/// Run a provider or module callback, turning a panic into a failure.
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, ProviderError>) -> Result<T, ProviderError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ProviderError::Failed(panic_message(payload.as_ref()))),
    }
}
