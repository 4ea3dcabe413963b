use broker_core::{CimException, CimStatusCode, ModuleKey, ModuleLoader, Provider, ProviderError, ProviderModule};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

pub type ModuleFactory =
    Arc<dyn Fn() -> Result<Arc<dyn ProviderModule>, ProviderError> + Send + Sync>;

pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Module loader backed by factories registered in this process.
///
/// Keys are module locations as carried in `ProviderName::location`.
#[derive(Default)]
pub struct InProcessLoader {
    factories: DashMap<String, ModuleFactory>,
}

impl InProcessLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory called each time the module is opened.
    pub fn register(&self, location: impl Into<String>, factory: ModuleFactory) {
        let location = location.into();
        tracing::info!(module = %location, "Registered in-process module");
        self.factories.insert(location, factory);
    }

    /// Register a module instance that is handed out on every open.
    pub fn register_module(&self, location: impl Into<String>, module: Arc<dyn ProviderModule>) {
        self.register(location, Arc::new(move || Ok::<_, ProviderError>(Arc::clone(&module))));
    }

    pub fn unregister(&self, location: &str) -> bool {
        self.factories.remove(location).is_some()
    }

    pub fn contains(&self, location: &str) -> bool {
        self.factories.contains_key(location)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl ModuleLoader for InProcessLoader {
    fn open(&self, key: &ModuleKey) -> Result<Arc<dyn ProviderModule>, ProviderError> {
        // Clone the factory out so the shard lock is not held while it runs.
        let factory = self
            .factories
            .get(key.as_str())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| {
                CimException::new(
                    CimStatusCode::NotFound,
                    format!("provider module {key} is not registered"),
                )
            })?;
        factory()
    }
}

/// A provider module assembled from named provider factories.
#[derive(Default)]
pub struct InProcessModule {
    providers: HashMap<String, ProviderFactory>,
}

impl InProcessModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: impl Into<String>, factory: ProviderFactory) -> Self {
        self.providers.insert(name.into(), factory);
        self
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

impl ProviderModule for InProcessModule {
    fn load(&self, provider_name: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(provider_name)
            .map(|factory| factory())
            .ok_or_else(|| {
                CimException::new(
                    CimStatusCode::NotFound,
                    format!("provider {provider_name} not found in module"),
                )
                .into()
            })
    }

    fn unload(&self) {}
}
