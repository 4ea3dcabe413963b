pub mod config;
pub mod error;
pub mod key;
pub mod message;
pub mod provider;

pub use config::BrokerConfig;
pub use error::{BrokerError, CimException, CimStatusCode, ProviderError};
pub use key::{ModuleKey, ProviderKey, ProviderName};
pub use message::{
    BrokerMessage, BrokerResponse, ModuleOperationalStatus, OperationKind, OperationRequest,
    OperationResponse,
};
pub use provider::{BrokerHandle, ModuleLoader, Provider, ProviderModule};
