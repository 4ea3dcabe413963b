use broker_core::{ModuleKey, ModuleLoader, Provider, ProviderError, ProviderModule};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::guarded;

struct ModuleState {
    handle: Option<Arc<dyn ProviderModule>>,
    /// Providers currently holding this module loaded.
    providers: usize,
}

/// One loadable provider library.
///
/// Shared by every provider entry that names it. The native handle is
/// opened on first provider load and released when the last provider
/// loaded from it goes away.
pub struct ModuleEntry {
    key: ModuleKey,
    loader: Arc<dyn ModuleLoader>,
    state: Mutex<ModuleState>,
}

impl ModuleEntry {
    pub fn new(key: ModuleKey, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            key,
            loader,
            state: Mutex::new(ModuleState {
                handle: None,
                providers: 0,
            }),
        }
    }

    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    /// Number of providers holding the module loaded.
    pub fn load_count(&self) -> usize {
        self.state.lock().providers
    }

    /// Load the module if needed and create `provider_name` from it. On
    /// success the caller holds one load reference and must give it back
    /// with [`ModuleEntry::release`].
    pub fn load_provider(&self, provider_name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        let mut state = self.state.lock();

        let handle = match state.handle.clone() {
            Some(handle) => handle,
            None => {
                let handle = guarded(|| self.loader.open(&self.key))?;
                info!(module = %self.key, "Provider module loaded");
                state.handle = Some(Arc::clone(&handle));
                handle
            }
        };

        match guarded(|| handle.load(provider_name)) {
            Ok(provider) => {
                state.providers += 1;
                debug!(module = %self.key, provider = provider_name, count = state.providers, "Provider created");
                Ok(provider)
            }
            Err(e) => {
                if state.providers == 0 {
                    Self::unload_locked(&self.key, &mut state);
                }
                Err(e)
            }
        }
    }

    /// Give back one load reference; unloads the module on the last one.
    pub fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.providers > 0, "module {} released more than loaded", self.key);
        state.providers = state.providers.saturating_sub(1);
        if state.providers == 0 {
            Self::unload_locked(&self.key, &mut state);
        }
    }

    /// Unload regardless of outstanding references. Teardown only.
    pub fn force_unload(&self) {
        let mut state = self.state.lock();
        if state.providers > 0 {
            warn!(module = %self.key, count = state.providers, "Force unloading module with loaded providers");
        }
        state.providers = 0;
        Self::unload_locked(&self.key, &mut state);
    }

    fn unload_locked(key: &ModuleKey, state: &mut ModuleState) {
        if let Some(handle) = state.handle.take() {
            if let Err(e) = guarded(|| {
                handle.unload();
                Ok(())
            }) {
                warn!(module = %key, error = %e, "Module unload failed");
            }
            info!(module = %key, "Provider module unloaded");
        }
    }
}
