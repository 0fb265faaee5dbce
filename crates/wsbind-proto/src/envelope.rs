use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation token tying a response to its originating request.
/// Callers may pick strings or integers; ids compare and hash by value
/// and must be unique among a connection's outstanding calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    Text(String),
    Number(i64),
}

impl CallId {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(CallId::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(CallId::Number),
            _ => None,
        }
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallId::Text(s) => f.write_str(s),
            CallId::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        CallId::Text(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        CallId::Text(s)
    }
}

impl From<i64> for CallId {
    fn from(n: i64) -> Self {
        CallId::Number(n)
    }
}

/// An invocation envelope. Arguments are positional; envelope property
/// names are camelCase on the wire, map-valued payloads keep the
/// casing of their own keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    pub function_name: String,
    pub arguments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
}

impl Request {
    pub fn new(function_name: impl Into<String>, arguments: Vec<Value>, call_id: impl Into<CallId>) -> Self {
        Self {
            function_name: function_name.into(),
            arguments,
            call_id: Some(call_id.into()),
        }
    }
}

/// A reply envelope. Exactly one of `return_value` / `error` is
/// meaningful: success carries `returnValue` (JSON `null` for void
/// methods), failure carries a non-empty `error` string.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub call_id: CallId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(call_id: CallId, value: Value) -> Self {
        Self {
            call_id,
            return_value: Some(value),
            error: None,
        }
    }

    pub fn failure(call_id: CallId, message: impl Into<String>) -> Self {
        Self {
            call_id,
            return_value: None,
            error: Some(message.into()),
        }
    }

    /// The carried outcome: `Err` with the peer's message when `error`
    /// is non-empty, the return value otherwise.
    pub fn result(&self) -> Result<&Value, &str> {
        match self.error.as_deref() {
            Some(error) if !error.is_empty() => Err(error),
            _ => Ok(self.return_value.as_ref().unwrap_or(&Value::Null)),
        }
    }
}

/// Parse a text frame as a request. A frame is a request iff it is a
/// JSON object with a non-empty string `functionName`; everything else
/// yields `None`.
pub fn parse_request(text: &str) -> Option<Request> {
    let request: Request = serde_json::from_str(text).ok()?;
    if request.function_name.is_empty() {
        return None;
    }
    Some(request)
}

/// Parse a text frame as a response: a JSON object carrying a `callId`
/// and at least one of `returnValue` / `error`, and no `functionName`.
pub fn parse_response(text: &str) -> Option<Response> {
    let map: Map<String, Value> = serde_json::from_str(text).ok()?;
    if map.contains_key("functionName") {
        return None;
    }
    let call_id = CallId::from_value(map.get("callId")?)?;
    if let Some(error) = map.get("error").and_then(Value::as_str)
        && !error.is_empty()
    {
        return Some(Response::failure(call_id, error));
    }
    let return_value = map.get("returnValue")?.clone();
    Some(Response::success(call_id, return_value))
}

/// A frame is RPC traffic iff it parses as a request or a response.
pub fn is_rpc_message(text: &str) -> bool {
    parse_request(text).is_some() || parse_response(text).is_some()
}
