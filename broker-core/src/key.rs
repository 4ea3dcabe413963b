use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical path or logical name of a loadable provider module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleKey(String);

impl ModuleKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Compound (module name, provider name) identity.
///
/// Two providers with the same name in different modules are distinct.
/// Equality and hashing use both fields, so pairs whose concatenations
/// collide are still different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    module: String,
    provider: String,
}

impl ProviderKey {
    pub fn new(module: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            provider: provider.into(),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.provider)
    }
}

/// Resolved provider identity: who to call and where its code lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderName {
    pub module_name: String,
    pub provider_name: String,
    /// Physical library path (or loader-specific module id).
    pub location: String,
}

impl ProviderName {
    pub fn new(
        module_name: impl Into<String>,
        provider_name: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            provider_name: provider_name.into(),
            location: location.into(),
        }
    }

    pub fn key(&self) -> ProviderKey {
        ProviderKey::new(&self.module_name, &self.provider_name)
    }

    pub fn module_key(&self) -> ModuleKey {
        ModuleKey::new(&self.location)
    }
}
