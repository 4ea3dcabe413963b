//! Provider plugin contract.
//!
//! The manager treats every call here as a black box: any of them may fail,
//! may panic, and may be slow. `terminate` is always called before the
//! owning module is unloaded.

use crate::error::ProviderError;
use crate::key::{ModuleKey, ProviderKey};
use crate::message::OperationRequest;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Per-provider handle back into the broker, created when the provider is
/// initialized and destroyed after its module is unloaded.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    id: Uuid,
    provider: ProviderKey,
    created_at: Instant,
}

impl BrokerHandle {
    pub fn new(provider: ProviderKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider,
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn provider(&self) -> &ProviderKey {
        &self.provider
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// A loaded provider instance.
pub trait Provider: Send + Sync {
    fn initialize(&self, broker: &BrokerHandle) -> Result<(), ProviderError>;

    /// Handle one operation. Called concurrently from many workers.
    fn handle(&self, request: &OperationRequest) -> Result<Value, ProviderError>;

    fn terminate(&self) -> Result<(), ProviderError>;

    /// Indication subscriptions have been restored after startup.
    fn subscription_init_complete(&self) {}

    /// The indication service was disabled.
    fn indication_service_disabled(&self) {}
}

/// A loaded module (library) that can produce provider instances.
pub trait ProviderModule: Send + Sync {
    /// Create the named provider.
    fn load(&self, provider_name: &str) -> Result<Arc<dyn Provider>, ProviderError>;

    /// Release the module's native resources. Called once, after every
    /// provider loaded from it has been terminated.
    fn unload(&self);
}

/// Opens modules by key. The concrete mechanism (dynamic library,
/// in-process registry, subprocess) lives behind this trait.
pub trait ModuleLoader: Send + Sync {
    fn open(&self, key: &ModuleKey) -> Result<Arc<dyn ProviderModule>, ProviderError>;
}
