use broker_core::{ModuleKey, ModuleLoader, ProviderKey, ProviderName};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::entry::ProviderEntry;
use crate::module::ModuleEntry;

#[derive(Default)]
struct Tables {
    modules: HashMap<ModuleKey, Arc<ModuleEntry>>,
    providers: HashMap<ProviderKey, Arc<ProviderEntry>>,
}

/// Module and provider tables.
///
/// Both tables sit behind one table lock. Per-entry work happens on
/// snapshots taken under that lock, never while holding it.
pub struct ProviderRegistry {
    tables: Mutex<Tables>,
    loader: Arc<dyn ModuleLoader>,
}

impl ProviderRegistry {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            loader,
        }
    }

    /// Existing module entry for `key`, or a new unloaded one.
    pub fn lookup_or_create_module(&self, key: &ModuleKey) -> Arc<ModuleEntry> {
        let mut tables = self.tables.lock();
        self.module_locked(&mut tables, key)
    }

    fn module_locked(&self, tables: &mut Tables, key: &ModuleKey) -> Arc<ModuleEntry> {
        let module = tables.modules.entry(key.clone()).or_insert_with(|| {
            debug!(module = %key, "Module entry created");
            Arc::new(ModuleEntry::new(key.clone(), Arc::clone(&self.loader)))
        });
        Arc::clone(module)
    }

    /// Existing provider entry (with its idle timer bumped), or a new
    /// uninitialized skeleton bound to the module at `name.location`.
    pub fn lookup_or_create_provider(&self, name: &ProviderName) -> Arc<ProviderEntry> {
        let key = name.key();
        let mut tables = self.tables.lock();

        if let Some(entry) = tables.providers.get(&key) {
            entry.touch();
            return Arc::clone(entry);
        }

        let module = self.module_locked(&mut tables, &name.module_key());
        let entry = Arc::new(ProviderEntry::new(key.clone(), name.location.clone(), module));
        debug!(module = %key.module(), provider = %key.provider(), "Provider entry created");
        tables.providers.insert(key, Arc::clone(&entry));
        entry
    }

    pub fn get_provider(&self, key: &ProviderKey) -> Option<Arc<ProviderEntry>> {
        self.tables.lock().providers.get(key).cloned()
    }

    /// Remove `key`. The caller has already seen it uninitialized.
    pub fn remove_provider(&self, key: &ProviderKey) -> bool {
        let removed = self.tables.lock().providers.remove(key);
        match removed {
            Some(entry) => {
                entry.retire();
                true
            }
            None => false,
        }
    }

    /// Remove `entry` if it is still the table's entry for its key and is
    /// uninitialized with nobody working on it.
    pub fn remove_if_uninitialized(&self, entry: &Arc<ProviderEntry>) -> bool {
        let mut tables = self.tables.lock();
        let current = match tables.providers.get(entry.key()) {
            Some(current) if Arc::ptr_eq(current, entry) => current,
            _ => return false,
        };
        if !current.try_retire() {
            return false;
        }
        tables.providers.remove(entry.key());
        debug!(module = %entry.key().module(), provider = %entry.key().provider(), "Provider entry removed");
        true
    }

    pub fn snapshot(&self) -> Vec<Arc<ProviderEntry>> {
        self.tables.lock().providers.values().cloned().collect()
    }

    /// Providers whose logical module name is `module`.
    pub fn snapshot_module(&self, module: &str) -> Vec<Arc<ProviderEntry>> {
        self.tables
            .lock()
            .providers
            .values()
            .filter(|e| e.key().module() == module)
            .cloned()
            .collect()
    }

    pub fn modules(&self) -> Vec<Arc<ModuleEntry>> {
        self.tables.lock().modules.values().cloned().collect()
    }

    pub fn provider_count(&self) -> usize {
        self.tables.lock().providers.len()
    }

    pub fn module_count(&self) -> usize {
        self.tables.lock().modules.len()
    }

    /// Empty both tables, returning what they held.
    pub(crate) fn drain(&self) -> (Vec<Arc<ProviderEntry>>, Vec<Arc<ModuleEntry>>) {
        let mut tables = self.tables.lock();
        let providers = tables.providers.drain().map(|(_, e)| e).collect();
        let modules = tables.modules.drain().map(|(_, m)| m).collect();
        (providers, modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::InProcessLoader;
    use std::thread;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(InProcessLoader::new()))
    }

    fn name(module: &str, provider: &str) -> ProviderName {
        ProviderName::new(module, provider, format!("lib{module}.so"))
    }

    #[test]
    fn test_empty_registry() {
        let reg = registry();
        assert_eq!(reg.provider_count(), 0);
        assert_eq!(reg.module_count(), 0);
        assert!(reg.get_provider(&ProviderKey::new("m", "p")).is_none());
    }

    #[test]
    fn test_lookup_or_create_is_idempotent() {
        let reg = registry();
        let a = reg.lookup_or_create_provider(&name("OS", "Proc"));
        let b = reg.lookup_or_create_provider(&name("OS", "Proc"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.provider_count(), 1);
        assert_eq!(reg.module_count(), 1);
    }

    #[test]
    fn test_providers_share_module_entry() {
        let reg = registry();
        let a = reg.lookup_or_create_provider(&name("OS", "Proc"));
        let b = reg.lookup_or_create_provider(&name("OS", "Disk"));
        assert!(Arc::ptr_eq(a.module(), b.module()));
        assert_eq!(reg.provider_count(), 2);
        assert_eq!(reg.module_count(), 1);
    }

    #[test]
    fn test_lookup_or_create_module_shares_provider_module() {
        let reg = registry();
        let module = reg.lookup_or_create_module(&ModuleKey::new("libOS.so"));
        assert!(!module.is_loaded());
        assert_eq!(reg.module_count(), 1);

        let entry = reg.lookup_or_create_provider(&name("OS", "Proc"));
        assert!(Arc::ptr_eq(&module, entry.module()));
        assert!(Arc::ptr_eq(
            &module,
            &reg.lookup_or_create_module(&ModuleKey::new("libOS.so"))
        ));
        assert_eq!(reg.module_count(), 1);
    }

    #[test]
    fn test_same_provider_name_in_two_modules_is_distinct() {
        let reg = registry();
        let a = reg.lookup_or_create_provider(&name("ModA", "Proc"));
        let b = reg.lookup_or_create_provider(&name("ModB", "Proc"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(reg.snapshot_module("ModA").len(), 1);
    }

    #[test]
    fn test_concurrent_lookup_creates_one_entry() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || reg.lookup_or_create_provider(&name("OS", "Proc")))
            })
            .collect();
        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
        assert_eq!(reg.provider_count(), 1);
    }

    #[test]
    fn test_remove_provider() {
        let reg = registry();
        let entry = reg.lookup_or_create_provider(&name("OS", "Proc"));
        assert!(reg.remove_provider(entry.key()));
        assert!(!reg.remove_provider(entry.key()));
        assert!(entry.is_retired());
        // Module entries live until teardown.
        assert_eq!(reg.module_count(), 1);
    }

    #[test]
    fn test_remove_if_uninitialized_checks_identity() {
        let reg = registry();
        let old = reg.lookup_or_create_provider(&name("OS", "Proc"));
        assert!(reg.remove_if_uninitialized(&old));

        let fresh = reg.lookup_or_create_provider(&name("OS", "Proc"));
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!reg.remove_if_uninitialized(&old));
        assert_eq!(reg.provider_count(), 1);
    }

    #[test]
    fn test_drain_empties_tables() {
        let reg = registry();
        reg.lookup_or_create_provider(&name("OS", "Proc"));
        reg.lookup_or_create_provider(&name("Net", "Port"));
        let (providers, modules) = reg.drain();
        assert_eq!(providers.len(), 2);
        assert_eq!(modules.len(), 2);
        assert_eq!(reg.provider_count(), 0);
    }
}
