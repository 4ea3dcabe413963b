use broker_core::error::panic_message;
use broker_core::{
    BrokerError, CimException, CimStatusCode, ModuleOperationalStatus, OperationKind,
    OperationRequest, ProviderError, ProviderName,
};
use serde_json::json;

fn request() -> OperationRequest {
    OperationRequest::new(
        ProviderName::new("OSModule", "OSProvider", "/usr/lib/libOSProvider.so"),
        OperationKind::EnumerateInstances,
        json!({"namespace": "root/cimv2", "class": "CIM_OperatingSystem"}),
    )
}

// =============================================================================
// CimStatusCode Tests
// =============================================================================

#[test]
fn test_status_code_values() {
    assert_eq!(CimStatusCode::Failed.code(), 1);
    assert_eq!(CimStatusCode::AccessDenied.code(), 2);
    assert_eq!(CimStatusCode::NotFound.code(), 6);
    assert_eq!(CimStatusCode::NotSupported.code(), 7);
    assert_eq!(CimStatusCode::MethodNotFound.code(), 17);
}

#[test]
fn test_status_code_display() {
    assert_eq!(format!("{}", CimStatusCode::Failed), "CIM_ERR_FAILED");
    assert_eq!(format!("{}", CimStatusCode::InvalidClass), "CIM_ERR_INVALID_CLASS");
}

#[test]
fn test_status_code_serde() {
    let json = serde_json::to_string(&CimStatusCode::NotFound).unwrap();
    assert_eq!(json, "\"NOT_FOUND\"");
}

// =============================================================================
// Error conversion Tests
// =============================================================================

#[test]
fn test_typed_provider_error_keeps_code() {
    let err = ProviderError::from(CimException::new(CimStatusCode::NotFound, "no such instance"));
    let cim = err.into_cim();
    assert_eq!(cim.code, CimStatusCode::NotFound);
    assert_eq!(cim.message, "no such instance");
}

#[test]
fn test_generic_provider_error_maps_to_failed() {
    let cim = ProviderError::failed("disk on fire").into_cim();
    assert_eq!(cim.code, CimStatusCode::Failed);
    assert_eq!(cim.message, "disk on fire");
}

#[test]
fn test_initialize_error_preserves_typed_cause() {
    let err = BrokerError::ProviderInitialize {
        provider: "provX".into(),
        source: CimException::new(CimStatusCode::AccessDenied, "nope").into(),
    };
    assert_eq!(err.to_cim().code, CimStatusCode::AccessDenied);
}

#[test]
fn test_initialization_failed_message() {
    let err = BrokerError::ProviderInitializationFailed("modA/provX".into());
    let cim = err.to_cim();
    assert_eq!(cim.code, CimStatusCode::Failed);
    assert!(cim.message.contains("provider initialization failed"));
}

#[test]
fn test_disabled_module_is_access_denied() {
    let err = BrokerError::ModuleDisabled("modA".into());
    assert_eq!(err.to_cim().code, CimStatusCode::AccessDenied);
}

#[test]
fn test_panic_message_variants() {
    let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
    assert_eq!(panic_message(boxed.as_ref()), "static str");
    let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
    assert_eq!(panic_message(boxed.as_ref()), "owned");
    let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
    assert_eq!(panic_message(boxed.as_ref()), "Unknown error.");
}

// =============================================================================
// Message Tests
// =============================================================================

#[test]
fn test_request_ids_are_unique() {
    assert_ne!(request().message_id, request().message_id);
}

#[test]
fn test_respond_carries_message_id() {
    let req = request();
    let ok = req.respond(Ok(json!([])));
    assert_eq!(ok.message_id, req.message_id);
    assert!(ok.is_ok());
    assert!(ok.error().is_none());

    let err = req.respond(Err(CimException::failed("boom")));
    assert!(!err.is_ok());
    assert_eq!(err.error().unwrap().message, "boom");
}

#[test]
fn test_operation_kind_serializes_snake_case() {
    let json = serde_json::to_string(&OperationKind::EnumerateInstanceNames).unwrap();
    assert_eq!(json, "\"enumerate_instance_names\"");
    assert_eq!(OperationKind::InvokeMethod.to_string(), "invoke_method");
}

#[test]
fn test_request_minimal_deserialization() {
    let raw = json!({
        "message_id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
        "provider": {
            "module_name": "m",
            "provider_name": "p",
            "location": "libm.so"
        },
        "kind": "get_instance"
    });
    let req: OperationRequest = serde_json::from_value(raw).unwrap();
    assert_eq!(req.kind, OperationKind::GetInstance);
    assert!(req.payload.is_null());
    assert_eq!(req.provider.key().provider(), "p");
}

#[test]
fn test_module_status_serde() {
    let json = serde_json::to_string(&ModuleOperationalStatus::Stopped).unwrap();
    assert_eq!(json, "\"stopped\"");
}
