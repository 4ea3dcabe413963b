use serde::{Deserialize, Serialize};
use thiserror::Error;

/// DMTF CIM status codes used by the broker and its providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CimStatusCode {
    Failed,
    AccessDenied,
    InvalidNamespace,
    InvalidParameter,
    InvalidClass,
    NotFound,
    NotSupported,
    ClassHasChildren,
    ClassHasInstances,
    InvalidSuperclass,
    AlreadyExists,
    NoSuchProperty,
    TypeMismatch,
    QueryLanguageNotSupported,
    InvalidQuery,
    MethodNotAvailable,
    MethodNotFound,
}

impl CimStatusCode {
    /// Numeric wire value.
    pub fn code(self) -> u16 {
        match self {
            CimStatusCode::Failed => 1,
            CimStatusCode::AccessDenied => 2,
            CimStatusCode::InvalidNamespace => 3,
            CimStatusCode::InvalidParameter => 4,
            CimStatusCode::InvalidClass => 5,
            CimStatusCode::NotFound => 6,
            CimStatusCode::NotSupported => 7,
            CimStatusCode::ClassHasChildren => 8,
            CimStatusCode::ClassHasInstances => 9,
            CimStatusCode::InvalidSuperclass => 10,
            CimStatusCode::AlreadyExists => 11,
            CimStatusCode::NoSuchProperty => 12,
            CimStatusCode::TypeMismatch => 13,
            CimStatusCode::QueryLanguageNotSupported => 14,
            CimStatusCode::InvalidQuery => 15,
            CimStatusCode::MethodNotAvailable => 16,
            CimStatusCode::MethodNotFound => 17,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CimStatusCode::Failed => "CIM_ERR_FAILED",
            CimStatusCode::AccessDenied => "CIM_ERR_ACCESS_DENIED",
            CimStatusCode::InvalidNamespace => "CIM_ERR_INVALID_NAMESPACE",
            CimStatusCode::InvalidParameter => "CIM_ERR_INVALID_PARAMETER",
            CimStatusCode::InvalidClass => "CIM_ERR_INVALID_CLASS",
            CimStatusCode::NotFound => "CIM_ERR_NOT_FOUND",
            CimStatusCode::NotSupported => "CIM_ERR_NOT_SUPPORTED",
            CimStatusCode::ClassHasChildren => "CIM_ERR_CLASS_HAS_CHILDREN",
            CimStatusCode::ClassHasInstances => "CIM_ERR_CLASS_HAS_INSTANCES",
            CimStatusCode::InvalidSuperclass => "CIM_ERR_INVALID_SUPERCLASS",
            CimStatusCode::AlreadyExists => "CIM_ERR_ALREADY_EXISTS",
            CimStatusCode::NoSuchProperty => "CIM_ERR_NO_SUCH_PROPERTY",
            CimStatusCode::TypeMismatch => "CIM_ERR_TYPE_MISMATCH",
            CimStatusCode::QueryLanguageNotSupported => "CIM_ERR_QUERY_LANGUAGE_NOT_SUPPORTED",
            CimStatusCode::InvalidQuery => "CIM_ERR_INVALID_QUERY",
            CimStatusCode::MethodNotAvailable => "CIM_ERR_METHOD_NOT_AVAILABLE",
            CimStatusCode::MethodNotFound => "CIM_ERR_METHOD_NOT_FOUND",
        }
    }
}

impl std::fmt::Display for CimStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed management-protocol error. Carried inside responses, never thrown
/// past the dispatch boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CimException {
    pub code: CimStatusCode,
    pub message: String,
}

impl CimException {
    pub fn new(code: CimStatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(CimStatusCode::Failed, message)
    }
}

/// Failure reported by a provider or provider module.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Typed management error (preserves the status code).
    #[error(transparent)]
    Cim(#[from] CimException),

    /// Generic failure.
    #[error("{0}")]
    Failed(String),
}

impl ProviderError {
    pub fn failed(message: impl Into<String>) -> Self {
        ProviderError::Failed(message.into())
    }

    /// Convert to the response-carried form.
    pub fn into_cim(self) -> CimException {
        match self {
            ProviderError::Cim(e) => e,
            ProviderError::Failed(msg) => CimException::failed(msg),
        }
    }
}

/// Unified error type for the broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to load provider {provider} from module {module}: {source}")]
    ProviderLoad {
        module: String,
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to initialize provider {provider}: {source}")]
    ProviderInitialize {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("provider initialization failed: {0}")]
    ProviderInitializationFailed(String),

    #[error("Library name for provider {0} is empty")]
    EmptyLibraryName(String),

    #[error("Provider module {0} is disabled")]
    ModuleDisabled(String),

    #[error("Provider manager is shutting down")]
    ShuttingDown,

    #[error("Provider {0} terminate failed: {1}")]
    Terminate(String, ProviderError),

    #[error("Internal: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Map to the response-carried management error.
    pub fn to_cim(&self) -> CimException {
        match self {
            BrokerError::ProviderLoad { source, .. }
            | BrokerError::ProviderInitialize { source, .. } => match source {
                ProviderError::Cim(e) => e.clone(),
                ProviderError::Failed(_) => CimException::failed(self.to_string()),
            },
            BrokerError::ModuleDisabled(_) => {
                CimException::new(CimStatusCode::AccessDenied, self.to_string())
            }
            _ => CimException::failed(self.to_string()),
        }
    }
}

/// Render a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown error.".to_string()
    }
}
