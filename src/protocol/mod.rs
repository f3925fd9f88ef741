//! Wire-level envelopes exchanged over the channel.
//!
//! Three variants flow between client and server:
//! ```text
//!   client ──▶ server   {"type":"request","id":7,"op":"str2et","args":[...]}
//!   server ──▶ client   {"type":"response","id":7,"ok":true,"value":...}
//!                       {"type":"response","id":7,"ok":false,"error":{"message":...}}
//!   client ──▶ server   {"type":"dispose"}
//! ```
//! Frames are plain JSON values. Incoming frames are structurally validated by
//! [`Message::decode`]; anything that does not fit one of the three shapes is a
//! [`Violation`].

pub mod binary;
pub mod codec;

use serde_json::{json, Map, Value};

use crate::types::{Error, RemoteError, RequestId};

const TYPE_REQUEST: &str = "request";
const TYPE_RESPONSE: &str = "response";
const TYPE_DISPOSE: &str = "dispose";

/// One operation call awaiting exactly one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub op: String,
    pub args: Vec<Value>,
}

/// Outcome of one operation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: std::result::Result<Value, RemoteError>,
}

impl Response {
    pub fn ok(id: RequestId, value: Value) -> Self {
        Self {
            id,
            outcome: Ok(value),
        }
    }

    pub fn err(id: RequestId, error: RemoteError) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}

/// Closed set of messages carried by the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    /// Server-bound: stop admitting new work.
    Dispose,
}

/// A frame that could not be decoded into a [`Message`].
///
/// `id` is set when the frame carried a usable request id, so the violation
/// can be reported to that one request instead of to every request.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub id: Option<RequestId>,
    pub reason: String,
}

impl Violation {
    fn new(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

impl From<Violation> for Error {
    fn from(v: Violation) -> Self {
        match v.id {
            Some(id) => Error::protocol(format!("message {}: {}", id, v.reason)),
            None => Error::protocol(v.reason),
        }
    }
}

impl Message {
    pub fn request(id: RequestId, op: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Request(Request {
            id,
            op: op.into(),
            args,
        })
    }

    /// Encode into a channel-transmissible frame.
    pub fn encode(&self) -> Value {
        match self {
            Message::Request(req) => json!({
                "type": TYPE_REQUEST,
                "id": req.id,
                "op": req.op,
                "args": req.args,
            }),
            Message::Response(Response { id, outcome: Ok(value) }) => json!({
                "type": TYPE_RESPONSE,
                "id": id,
                "ok": true,
                "value": value,
            }),
            Message::Response(Response { id, outcome: Err(error) }) => json!({
                "type": TYPE_RESPONSE,
                "id": id,
                "ok": false,
                "error": error,
            }),
            Message::Dispose => json!({ "type": TYPE_DISPOSE }),
        }
    }

    /// Validate and decode an incoming frame.
    pub fn decode(frame: Value) -> std::result::Result<Message, Violation> {
        let mut obj = match frame {
            Value::Object(obj) => obj,
            other => {
                return Err(Violation::new(
                    None,
                    format!("expected an object, got {}", json_type(&other)),
                ))
            }
        };

        let id = obj.get("id").and_then(Value::as_u64).map(RequestId::new);
        let kind = match obj.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(Violation::new(id, "missing message type")),
        };

        match kind.as_str() {
            TYPE_DISPOSE => Ok(Message::Dispose),
            TYPE_REQUEST => {
                let id = id.ok_or_else(|| Violation::new(None, "request without id"))?;
                let op = obj
                    .get("op")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Violation::new(Some(id), "request without op"))?;
                let args = match obj.remove("args") {
                    Some(Value::Array(args)) => args,
                    None | Some(Value::Null) => Vec::new(),
                    Some(_) => return Err(Violation::new(Some(id), "args must be an array")),
                };
                Ok(Message::Request(Request { id, op, args }))
            }
            TYPE_RESPONSE => {
                let id = id.ok_or_else(|| Violation::new(None, "response without id"))?;
                decode_response(id, &mut obj).map(Message::Response)
            }
            other => Err(Violation::new(id, format!("unknown message type: {}", other))),
        }
    }
}

fn decode_response(
    id: RequestId,
    obj: &mut Map<String, Value>,
) -> std::result::Result<Response, Violation> {
    match obj.get("ok").and_then(Value::as_bool) {
        Some(true) => {
            let value = obj
                .remove("value")
                .ok_or_else(|| Violation::new(Some(id), "ok response without value"))?;
            Ok(Response::ok(id, value))
        }
        Some(false) => {
            let raw = obj
                .remove("error")
                .ok_or_else(|| Violation::new(Some(id), "error response without error"))?;
            let error: RemoteError = serde_json::from_value(raw)
                .map_err(|e| Violation::new(Some(id), format!("malformed error: {}", e)))?;
            Ok(Response::err(id, error))
        }
        None => Err(Violation::new(Some(id), "response without ok flag")),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_wire_shape() {
        let msg = Message::request(RequestId::new(3), "str2et", vec![json!("2000-01-01")]);
        assert_eq!(
            msg.encode(),
            json!({"type": "request", "id": 3, "op": "str2et", "args": ["2000-01-01"]})
        );
        assert_eq!(Message::decode(msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_error_response_wire_shape() {
        let msg = Message::Response(Response::err(
            RequestId::new(9),
            RemoteError::named("SpiceError", "kernel not loaded"),
        ));
        assert_eq!(
            msg.encode(),
            json!({
                "type": "response",
                "id": 9,
                "ok": false,
                "error": {"message": "kernel not loaded", "name": "SpiceError"}
            })
        );
    }

    #[test]
    fn test_null_value_is_a_valid_ok_response() {
        let decoded =
            Message::decode(json!({"type": "response", "id": 1, "ok": true, "value": null}))
                .unwrap();
        assert_eq!(decoded, Message::Response(Response::ok(RequestId::new(1), Value::Null)));
    }

    #[test]
    fn test_missing_value_is_violation_with_id() {
        let v = Message::decode(json!({"type": "response", "id": 4, "ok": true})).unwrap_err();
        assert_eq!(v.id, Some(RequestId::new(4)));
        assert!(v.reason.contains("without value"));
    }

    #[test]
    fn test_missing_error_is_violation_with_id() {
        let v = Message::decode(json!({"type": "response", "id": 5, "ok": false})).unwrap_err();
        assert_eq!(v.id, Some(RequestId::new(5)));
    }

    #[test]
    fn test_missing_discriminant() {
        let v = Message::decode(json!({"id": 2, "ok": true, "value": 1})).unwrap_err();
        assert_eq!(v.id, Some(RequestId::new(2)));
        assert!(v.reason.contains("missing message type"));
    }

    #[test]
    fn test_non_object_frame() {
        let v = Message::decode(json!([1, 2, 3])).unwrap_err();
        assert_eq!(v.id, None);
        let err: Error = v.into();
        assert_eq!(err.kind(), crate::types::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_dispose_round_trip() {
        assert_eq!(Message::Dispose.encode(), json!({"type": "dispose"}));
        assert_eq!(Message::decode(json!({"type": "dispose"})).unwrap(), Message::Dispose);
    }

    #[test]
    fn test_request_without_args_defaults_to_empty() {
        let decoded = Message::decode(json!({"type": "request", "id": 1, "op": "tkvrsn"})).unwrap();
        assert_eq!(decoded, Message::request(RequestId::new(1), "tkvrsn", vec![]));
    }
}
