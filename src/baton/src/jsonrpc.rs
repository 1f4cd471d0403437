//! The JSON-RPC 2.0 frame model.
//!
//! Frames are classified by shape: a [`Request`] carries a `method` (and is a
//! notification when its `id` is absent); a [`Response`] carries `result` or
//! `error`. Anything else is invalid and surfaces as an [`Error`] from
//! [`Message::from_value`].
//!
//! Payloads stay as free-form [`serde_json::Value`]s end to end: the
//! conductor inspects only the handful of fields it routes on, and untouched
//! branches round-trip unchanged (`serde_json` is built with
//! `preserve_order`, so key order survives too).

use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// A request identifier: a string or an integer, with the original JSON type
/// preserved exactly through id rewriting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::String(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

/// A JSON-RPC request. `id: None` makes it a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: Id, method: impl ToString, params: Option<Value>) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: impl ToString, params: Option<Value>) -> Self {
        Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC response carrying either a `result` or an `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl Response {
    pub fn success(id: Option<Id>, result: Value) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Id>, error: Error) -> Self {
        Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse the `result`/`error` pair into a `Result`.
    pub fn into_result(self) -> Result<Value, Error> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// A classified JSON-RPC frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Parse one newline-delimited frame.
    pub fn from_line(line: &str) -> Result<Message, Error> {
        let value: Value = serde_json::from_str(line)?;
        Message::from_value(value)
    }

    /// Classify a JSON value as a request, notification, or response.
    pub fn from_value(value: Value) -> Result<Message, Error> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::invalid_request().with_data("frame is not a JSON object"))?;

        if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(Error::invalid_request().with_data("frame is missing `\"jsonrpc\": \"2.0\"`"));
        }

        if object.contains_key("method") {
            let request: Request = serde_json::from_value(value)
                .map_err(|err| Error::invalid_request().with_data(err.to_string()))?;
            Ok(Message::Request(request))
        } else if object.contains_key("result") || object.contains_key("error") {
            let response: Response = serde_json::from_value(value)
                .map_err(|err| Error::invalid_request().with_data(err.to_string()))?;
            Ok(Message::Response(response))
        } else {
            Err(Error::invalid_request().with_data("frame has neither `method` nor `result`/`error`"))
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Response(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_request_notification_response() {
        let m = Message::from_line(r#"{"jsonrpc":"2.0","id":1,"method":"foo","params":{"a":1}}"#).unwrap();
        assert!(matches!(m, Message::Request(ref r) if !r.is_notification()));

        let m = Message::from_line(r#"{"jsonrpc":"2.0","method":"foo"}"#).unwrap();
        assert!(matches!(m, Message::Request(ref r) if r.is_notification()));

        let m = Message::from_line(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(m, Message::Response(_)));

        let m = Message::from_line(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}}"#)
            .unwrap();
        match m {
            Message::Response(response) => {
                assert_eq!(response.into_result().unwrap_err().code, crate::error::METHOD_NOT_FOUND)
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn rejects_invalid_frames() {
        assert!(Message::from_line("not json").is_err());
        assert!(Message::from_line("[1,2,3]").is_err());
        assert!(Message::from_line(r#"{"id":1,"method":"foo"}"#).is_err());
        assert!(Message::from_line(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
    }

    #[test]
    fn id_types_survive_round_trips() {
        let request = Request::new(Id::from("string-id-123"), "bar", None);
        let line = serde_json::to_string(&Message::Request(request)).unwrap();
        assert!(line.contains(r#""id":"string-id-123""#));

        let request = Request::new(Id::from(999), "bar", None);
        let line = serde_json::to_string(&Message::Request(request)).unwrap();
        assert!(line.contains(r#""id":999"#));
    }

    #[test]
    fn untouched_params_keep_key_order() {
        let line = r#"{"jsonrpc":"2.0","id":1,"method":"foo","params":{"z":1,"a":2,"m":{"b":3,"a":4}}}"#;
        let message = Message::from_line(line).unwrap();
        assert_eq!(serde_json::to_string(&message).unwrap(), line);
    }

    #[test]
    fn response_result_error_collapse() {
        let ok = Response::success(Some(Id::from(1)), json!({"k": "v"}));
        assert_eq!(ok.into_result().unwrap(), json!({"k": "v"}));

        let err = Response::failure(Some(Id::from(1)), Error::internal_error());
        assert_eq!(err.into_result().unwrap_err().code, crate::error::INTERNAL_ERROR);
    }
}
