use crate::error::CimException;
use crate::key::ProviderName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Provider-bound request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    GetInstance,
    EnumerateInstances,
    EnumerateInstanceNames,
    CreateInstance,
    ModifyInstance,
    DeleteInstance,
    ExecQuery,
    Associators,
    AssociatorNames,
    References,
    ReferenceNames,
    GetProperty,
    SetProperty,
    InvokeMethod,
    CreateSubscription,
    ModifySubscription,
    DeleteSubscription,
    ExportIndication,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::GetInstance => "get_instance",
            OperationKind::EnumerateInstances => "enumerate_instances",
            OperationKind::EnumerateInstanceNames => "enumerate_instance_names",
            OperationKind::CreateInstance => "create_instance",
            OperationKind::ModifyInstance => "modify_instance",
            OperationKind::DeleteInstance => "delete_instance",
            OperationKind::ExecQuery => "exec_query",
            OperationKind::Associators => "associators",
            OperationKind::AssociatorNames => "associator_names",
            OperationKind::References => "references",
            OperationKind::ReferenceNames => "reference_names",
            OperationKind::GetProperty => "get_property",
            OperationKind::SetProperty => "set_property",
            OperationKind::InvokeMethod => "invoke_method",
            OperationKind::CreateSubscription => "create_subscription",
            OperationKind::ModifySubscription => "modify_subscription",
            OperationKind::DeleteSubscription => "delete_subscription",
            OperationKind::ExportIndication => "export_indication",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound operation, already resolved to a provider identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub message_id: Uuid,
    pub provider: ProviderName,
    pub kind: OperationKind,
    /// Opaque operation payload (object path, properties, query, ...).
    #[serde(default)]
    pub payload: Value,
}

impl OperationRequest {
    pub fn new(provider: ProviderName, kind: OperationKind, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            provider,
            kind,
            payload,
        }
    }

    /// Build the response that answers this request.
    pub fn respond(&self, result: Result<Value, CimException>) -> OperationResponse {
        OperationResponse {
            message_id: self.message_id,
            result,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub message_id: Uuid,
    pub result: Result<Value, CimException>,
}

impl OperationResponse {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&CimException> {
        self.result.as_ref().err()
    }
}

/// Operational status reported back for module enable/disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleOperationalStatus {
    /// Module stays enabled (disable refused or enable acknowledged).
    Ok,
    /// Module providers were unloaded and the module is disabled.
    Stopped,
}

/// Everything the hosting server can hand to the provider manager.
#[derive(Debug, Clone)]
pub enum BrokerMessage {
    Operation(OperationRequest),
    DisableModule {
        module: String,
        /// Providers to disable; empty = every provider of the module
        /// currently in the provider table.
        providers: Vec<String>,
    },
    EnableModule {
        module: String,
    },
    StopAllProviders,
    SubscriptionInitComplete,
    IndicationServiceDisabled,
}

#[derive(Debug, Clone)]
pub enum BrokerResponse {
    Operation(OperationResponse),
    ModuleStatus(Vec<ModuleOperationalStatus>),
    Ack,
}
