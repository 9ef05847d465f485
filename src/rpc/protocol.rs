//! JSON-RPC 2.0 message types (https://www.jsonrpc.org/specification).

use serde::{Deserialize, Serialize};
use serde_json::Value;

const VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(Value::from(id)),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        match (self.jsonrpc.as_str(), self.method.is_empty()) {
            (VERSION, false) => Ok(()),
            (VERSION, true) => Err("method must not be empty"),
            _ => Err("jsonrpc must be \"2.0\""),
        }
    }
}

/// Error codes used on the wire. The `-320xx` ones are ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    JobNotFound,
    InvalidOperation,
    RemoteFailure,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::Internal => -32603,
            ErrorCode::JobNotFound => -32001,
            ErrorCode::InvalidOperation => -32002,
            ErrorCode::RemoteFailure => -32010,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code == code.code()
    }
}

/// Exactly one of `result` or `error`, as the member name on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub id: Value,
}

impl Response {
    fn new(id: Value, outcome: Outcome) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            outcome,
            id,
        }
    }

    pub fn ok(id: Value, result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self::new(id, Outcome::Result(value)),
            Err(e) => Self::fail(
                id,
                ErrorCode::Internal,
                format!("failed to encode result: {}", e),
            ),
        }
    }

    pub fn fail(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            id,
            Outcome::Error(RpcError {
                code: code.code(),
                message: message.into(),
                data: None,
            }),
        )
    }

    /// The request could not be decoded, so its id is unknown.
    pub fn parse_error() -> Self {
        Self::fail(Value::Null, ErrorCode::ParseError, "Parse error")
    }

    pub fn invalid_request(id: Value, reason: &str) -> Self {
        let mut response = Self::fail(id, ErrorCode::InvalidRequest, "Invalid request");
        if let Outcome::Error(error) = &mut response.outcome {
            error.data = Some(Value::from(reason));
        }
        response
    }

    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_id_and_params() {
        let json = r#"{"jsonrpc":"2.0","method":"jobs.cancel","params":{"id":"x"},"id":7}"#;
        let req: Request = serde_json::from_str(json).unwrap();

        assert_eq!(req.method, "jobs.cancel");
        assert_eq!(req.params, Some(serde_json::json!({ "id": "x" })));
        assert_eq!(req.id, Some(Value::from(7)));
        assert!(req.validate().is_ok());
        assert!(!req.is_notification());
    }

    #[test]
    fn notification_has_no_id() {
        let req: Request = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"jobs.prune"}"#).unwrap();
        assert!(req.is_notification());
        assert!(req.params.is_none());
    }

    #[test]
    fn validation() {
        let old: Request = serde_json::from_str(r#"{"jsonrpc":"1.0","method":"x","id":1}"#).unwrap();
        assert_eq!(old.validate(), Err("jsonrpc must be \"2.0\""));

        let blank: Request = serde_json::from_str(r#"{"jsonrpc":"2.0","method":"","id":1}"#).unwrap();
        assert_eq!(blank.validate(), Err("method must not be empty"));
    }

    #[test]
    fn success_has_result_member_only() {
        let value = serde_json::to_value(Response::ok(Value::from(1), "ok")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "jsonrpc": "2.0", "result": "ok", "id": 1 })
        );
    }

    #[test]
    fn error_round_trips_through_the_wire() {
        let resp = Response::fail(Value::from("abc"), ErrorCode::MethodNotFound, "Method not found: x");
        let encoded = serde_json::to_string(&resp).unwrap();
        assert!(encoded.contains(r#""code":-32601"#));
        assert!(!encoded.contains("result"));

        let decoded: Response = serde_json::from_str(&encoded).unwrap();
        let err = decoded.into_result().unwrap_err();
        assert!(err.is(ErrorCode::MethodNotFound));
        assert_eq!(err.message, "Method not found: x");
    }

    #[test]
    fn null_result_is_still_a_success() {
        let decoded: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":null,"id":3}"#).unwrap();
        assert_eq!(decoded.into_result(), Ok(Value::Null));
    }

    #[test]
    fn invalid_request_carries_reason() {
        let err = Response::invalid_request(Value::Null, "method must not be empty")
            .into_result()
            .unwrap_err();
        assert!(err.is(ErrorCode::InvalidRequest));
        assert_eq!(err.data, Some(Value::from("method must not be empty")));
    }
}
