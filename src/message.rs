//! JSON-RPC 2.0 message model.
//!
//! Every object on the wire carries `"jsonrpc": "2.0"`. A message with a
//! `method` field is a request (when it also carries an `id`) or a
//! notification (when it does not); anything else is a response. A response
//! carries an `id` matching the request, or `null` when the peer could not
//! parse the request's id.
//!
//! # Example
//!
//! ```
//! use peerwire::message::{Message, RequestId};
//! use serde_json::json;
//!
//! let msg = Message::request("calculate", Some(json!({"name": "foo"})), RequestId::Number(0));
//! let wire = serde_json::to_value(&msg).unwrap();
//! assert_eq!(wire["jsonrpc"], "2.0");
//! assert_eq!(wire["method"], "calculate");
//! ```

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// The protocol version stamped on every wire object.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method-name prefix reserved by the JSON-RPC spec.
///
/// Applications should not register or call methods starting with this.
pub const RESERVED_METHOD_PREFIX: &str = "rpc.";

/// Standard and library-defined error codes.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The message is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not registered.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// The params did not match the method's schema.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Start of the reserved server-error range.
    pub const SERVER_ERROR_START: i64 = -32099;
    /// End of the reserved server-error range.
    pub const SERVER_ERROR_END: i64 = -32000;
    /// A handler failed in a way it did not anticipate.
    pub const UNEXPECTED_SERVER_ERROR: i64 = -32000;
    /// A handler returned an error without choosing a code.
    pub const GENERIC_APPLICATION_ERROR: i64 = -320100;
}

/// Request id: a non-negative integer or a string.
///
/// Ids are compared by their string form ([`RequestId::key`]) so that a peer
/// answering a numeric id with a string id (or vice versa) still correlates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id, issued by the channel's monotonic counter.
    Number(u64),
    /// String id, accepted from peers that issue them.
    String(String),
}

impl RequestId {
    /// String form of the id, used as the pending-table key.
    pub fn key(&self) -> String {
        match self {
            RequestId::Number(n) => n.to_string(),
            RequestId::String(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

/// JSON-RPC error object carried in an error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code, see [`codes`].
    pub code: i64,
    /// Short human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object with the given code and message.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a data payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `METHOD_NOT_FOUND` with a diagnostic message.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("Method `{}` is not registered", method),
        )
    }

    /// `INVALID_REQUEST` with an explanation.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    /// `INVALID_PARAMS`; serializer messages go under `data.errors`.
    pub fn invalid_params(errors: Vec<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params")
            .with_data(serde_json::json!({ "errors": errors }))
    }

    /// `INTERNAL_ERROR` with a generic message.
    pub fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    /// `UNEXPECTED_SERVER_ERROR` with a generic message.
    pub fn unexpected_server_error() -> Self {
        Self::new(
            codes::UNEXPECTED_SERVER_ERROR,
            "An unexpected error occurred while handling the request",
        )
    }
}

/// A request: carries an id and expects exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub method: String,
    pub params: Option<Value>,
    pub id: RequestId,
}

/// A notification: one-way, no id, no response.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationMessage {
    pub method: String,
    pub params: Option<Value>,
}

/// A response: either a result or an error, never both.
///
/// Both fields are optional at the wire level; a response carrying neither
/// is a protocol violation surfaced to the caller by the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMessage {
    /// `None` encodes the wire-level `null` id.
    pub id: Option<RequestId>,
    pub result: Option<Value>,
    pub error: Option<ErrorObject>,
}

/// Any JSON-RPC 2.0 message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
}

impl Message {
    /// Build a request message.
    pub fn request(method: impl Into<String>, params: Option<Value>, id: RequestId) -> Self {
        Message::Request(RequestMessage {
            method: method.into(),
            params,
            id,
        })
    }

    /// Build a notification message.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(NotificationMessage {
            method: method.into(),
            params,
        })
    }

    /// Build a success response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Message::Response(ResponseMessage {
            id: Some(id),
            result: Some(result),
            error: None,
        })
    }

    /// Build an error response. `id` is `None` when the request id could not
    /// be recovered.
    pub fn error_response(id: Option<RequestId>, error: ErrorObject) -> Self {
        Message::Response(ResponseMessage {
            id,
            result: None,
            error: Some(error),
        })
    }

    /// Method name for requests and notifications, `None` for responses.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) => None,
        }
    }
}

/// `true` when a params value has a shape JSON-RPC allows.
///
/// `params` must be an object, an array, or null; scalars are rejected on
/// both the send and the receive path.
pub fn is_valid_params_shape(params: &Value) -> bool {
    matches!(params, Value::Object(_) | Value::Array(_) | Value::Null)
}

impl Serialize for Message {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Message::Request(r) => {
                map.insert("method".into(), Value::String(r.method.clone()));
                if let Some(params) = &r.params {
                    map.insert("params".into(), params.clone());
                }
                map.insert(
                    "id".into(),
                    serde_json::to_value(&r.id).map_err(serde::ser::Error::custom)?,
                );
            }
            Message::Notification(n) => {
                map.insert("method".into(), Value::String(n.method.clone()));
                if let Some(params) = &n.params {
                    map.insert("params".into(), params.clone());
                }
            }
            Message::Response(resp) => {
                map.insert(
                    "id".into(),
                    match &resp.id {
                        Some(id) => serde_json::to_value(id).map_err(serde::ser::Error::custom)?,
                        None => Value::Null,
                    },
                );
                if let Some(error) = &resp.error {
                    map.insert(
                        "error".into(),
                        serde_json::to_value(error).map_err(serde::ser::Error::custom)?,
                    );
                } else {
                    // A success response always carries `result`, even when null.
                    map.insert(
                        "result".into(),
                        resp.result.clone().unwrap_or(Value::Null),
                    );
                }
            }
        }
        map.serialize(serializer)
    }
}

/// Wire shape used during classification.
#[derive(Deserialize)]
struct RawMessage {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    method: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

fn parse_id<E: serde::de::Error>(value: Value) -> Result<Option<RequestId>, E> {
    match value {
        Value::Null => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(|e| E::custom(format!("invalid request id: {}", e))),
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawMessage::deserialize(deserializer)?;
        match raw.method {
            Some(method) => {
                let id = match raw.id {
                    Some(value) => parse_id(value)?,
                    None => None,
                };
                match id {
                    Some(id) => Ok(Message::Request(RequestMessage {
                        method,
                        params: raw.params,
                        id,
                    })),
                    // A null or absent id makes this a notification.
                    None => Ok(Message::Notification(NotificationMessage {
                        method,
                        params: raw.params,
                    })),
                }
            }
            None => {
                if raw.id.is_none() && raw.result.is_none() && raw.error.is_none() {
                    return Err(D::Error::custom(
                        "message has neither `method` nor any response field",
                    ));
                }
                let id = match raw.id {
                    Some(value) => parse_id(value)?,
                    None => None,
                };
                Ok(Message::Response(ResponseMessage {
                    id,
                    result: raw.result,
                    error: raw.error,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let msg = Message::request("calc", Some(json!({"name": "foo"})), RequestId::Number(7));
        let wire = serde_json::to_value(&msg).unwrap();

        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["method"], "calc");
        assert_eq!(wire["id"], 7);

        let back: Message = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = Message::notification("progress", Some(json!({"progress": 0.5})));
        let wire = serde_json::to_value(&msg).unwrap();

        assert!(wire.get("id").is_none());

        let back: Message = serde_json::from_value(wire).unwrap();
        assert!(matches!(back, Message::Notification(_)));
    }

    #[test]
    fn test_method_with_null_id_is_notification() {
        let wire = json!({"jsonrpc": "2.0", "method": "ping", "id": null});
        let back: Message = serde_json::from_value(wire).unwrap();
        assert!(matches!(back, Message::Notification(_)));
    }

    #[test]
    fn test_success_response_roundtrip() {
        let msg = Message::success(RequestId::Number(3), json!("blafoo"));
        let wire = serde_json::to_value(&msg).unwrap();

        assert_eq!(wire["result"], "blafoo");
        assert!(wire.get("error").is_none());

        let back: Message = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_error_response_with_null_id() {
        let msg = Message::error_response(None, ErrorObject::new(codes::PARSE_ERROR, "bad json"));
        let wire = serde_json::to_value(&msg).unwrap();

        assert_eq!(wire["id"], Value::Null);
        assert_eq!(wire["error"]["code"], -32700);

        let back: Message = serde_json::from_value(wire).unwrap();
        match back {
            Message::Response(resp) => {
                assert!(resp.id.is_none());
                assert_eq!(resp.error.unwrap().code, codes::PARSE_ERROR);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_string_and_numeric_ids_share_a_key() {
        assert_eq!(RequestId::Number(42).key(), RequestId::String("42".into()).key());
        assert_ne!(RequestId::Number(42).key(), RequestId::Number(43).key());
    }

    #[test]
    fn test_response_without_result_or_error_parses() {
        // The channel treats this as a protocol violation; parsing keeps it.
        let wire = json!({"jsonrpc": "2.0", "id": 5});
        let back: Message = serde_json::from_value(wire).unwrap();
        match back {
            Message::Response(resp) => {
                assert!(resp.result.is_none());
                assert!(resp.error.is_none());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_object_is_rejected() {
        let wire = json!({"jsonrpc": "2.0"});
        assert!(serde_json::from_value::<Message>(wire).is_err());
    }

    #[test]
    fn test_params_shape() {
        assert!(is_valid_params_shape(&json!({})));
        assert!(is_valid_params_shape(&json!([1, 2])));
        assert!(is_valid_params_shape(&Value::Null));
        assert!(!is_valid_params_shape(&json!(5)));
        assert!(!is_valid_params_shape(&json!("text")));
        assert!(!is_valid_params_shape(&json!(true)));
    }

    #[test]
    fn test_invalid_params_helper_carries_errors() {
        let err = ErrorObject::invalid_params(vec!["missing field `name`".into()]);
        assert_eq!(err.code, codes::INVALID_PARAMS);
        assert_eq!(err.data.unwrap()["errors"][0], "missing field `name`");
    }
}
