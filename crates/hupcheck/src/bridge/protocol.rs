//! Wire protocol types for driver-host communication.
//!
//! One channel in each direction:
//! - **driver → host** (host stdin): [`Call`]
//! - **host → driver** (host stdout): [`CallResult`], including the startup
//!   announcement every generation writes before dispatching.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation token pairing a [`Call`] with its [`CallResult`].
///
/// UUID v4 for regular calls. The nil UUID is reserved for the startup
/// announcement and is never generated for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Id carried by the startup announcement.
    pub const fn startup() -> Self {
        Self(uuid::Uuid::nil())
    }

    pub fn is_startup(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One remote invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Call {
    pub fn new(operation: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            id: CallId::new(),
            operation: operation.into(),
            args,
            kwargs,
        }
    }
}

/// Category of a [`Fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// No handler is registered under the requested name.
    UnknownOperation,
    /// An argument was missing or had the wrong shape.
    InvalidArgument,
    /// The operation ran and returned an error.
    OperationFailed,
    /// A pre/post hook refused the call.
    HookFailed,
    /// The generation answering this call was retired by a restart.
    Restart,
    Internal,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownOperation => "unknown_operation",
            Self::InvalidArgument => "invalid_argument",
            Self::OperationFailed => "operation_failed",
            Self::HookFailed => "hook_failed",
            Self::Restart => "restart",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable failure, transmitted in place of a native error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn unknown_operation(operation: &str) -> Self {
        Self::new(
            FaultKind::UnknownOperation,
            format!("no operation named {operation:?}"),
        )
        .with_detail(Value::String(operation.to_string()))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidArgument, message)
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::OperationFailed, message)
    }

    pub fn hook_failed(message: impl Into<String>) -> Self {
        Self::new(FaultKind::HookFailed, message)
    }

    pub fn restart(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Restart, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, message)
    }

    pub fn is_restart(&self) -> bool {
        self.kind == FaultKind::Restart
    }
}

impl From<std::io::Error> for Fault {
    fn from(e: std::io::Error) -> Self {
        Self::operation_failed(e.to_string()).with_detail(Value::String(format!("{:?}", e.kind())))
    }
}

/// Outcome half of a [`CallResult`]: exactly one of value or fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(Value),
    Fault(Fault),
}

impl Outcome {
    pub fn into_result(self) -> Result<Value, Fault> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Fault(f) => Err(f),
        }
    }
}

impl From<Result<Value, Fault>> for Outcome {
    fn from(r: Result<Value, Fault>) -> Self {
        match r {
            Ok(v) => Self::Value(v),
            Err(f) => Self::Fault(f),
        }
    }
}

/// Answer to a [`Call`], or the startup announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResult {
    pub id: CallId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl CallResult {
    pub fn value(id: CallId, value: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Value(value),
        }
    }

    pub fn fault(id: CallId, fault: Fault) -> Self {
        Self {
            id,
            outcome: Outcome::Fault(fault),
        }
    }

    /// Null result written once per generation before dispatch starts.
    pub fn startup() -> Self {
        Self::value(CallId::startup(), Value::Null)
    }

    pub fn is_startup(&self) -> bool {
        self.id.is_startup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_call_id() -> CallId {
        CallId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn call_serializes() {
        let mut kwargs = Map::new();
        kwargs.insert("port".to_string(), json!(7869));
        let call = Call {
            id: test_call_id(),
            operation: "bind".to_string(),
            args: vec![json!("")],
            kwargs,
        };
        insta::assert_json_snapshot!(call, @r#"
        {
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "operation": "bind",
          "args": [
            ""
          ],
          "kwargs": {
            "port": 7869
          }
        }
        "#);
    }

    #[test]
    fn call_without_arguments_deserializes() {
        let call: Call = serde_json::from_value(json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "operation": "run"
        }))
        .unwrap();
        assert_eq!(call.operation, "run");
        assert!(call.args.is_empty());
        assert!(call.kwargs.is_empty());
    }

    #[test]
    fn value_result_serializes() {
        let result = CallResult::value(test_call_id(), json!({"pids": [1, 2]}));
        insta::assert_json_snapshot!(result, @r#"
        {
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "value": {
            "pids": [
              1,
              2
            ]
          }
        }
        "#);
    }

    #[test]
    fn restart_fault_serializes() {
        let result = CallResult::fault(test_call_id(), Fault::restart("generation retired"));
        insta::assert_json_snapshot!(result, @r#"
        {
          "id": "550e8400-e29b-41d4-a716-446655440000",
          "fault": {
            "kind": "restart",
            "message": "generation retired"
          }
        }
        "#);
    }

    #[test]
    fn startup_announcement_uses_nil_id() {
        let result = CallResult::startup();
        assert!(result.is_startup());
        assert_eq!(result.outcome, Outcome::Value(Value::Null));

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["id"], json!("00000000-0000-0000-0000-000000000000"));
    }

    #[test]
    fn generated_ids_are_never_startup() {
        for _ in 0..64 {
            assert!(!CallId::new().is_startup());
        }
    }

    #[test]
    fn fault_reconstructs_message() {
        let fault = Fault::unknown_operation("frobnicate");
        assert_eq!(fault.kind, FaultKind::UnknownOperation);
        assert_eq!(fault.to_string(), "unknown_operation: no operation named \"frobnicate\"");
        assert_eq!(fault.detail, Some(json!("frobnicate")));
    }

    #[test]
    fn io_error_becomes_operation_fault() {
        let err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let fault = Fault::from(err);
        assert_eq!(fault.kind, FaultKind::OperationFailed);
        assert_eq!(fault.detail, Some(json!("AddrInUse")));
    }
}
