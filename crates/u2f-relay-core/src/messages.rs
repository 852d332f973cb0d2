//! Page-facing message types.
//!
//! Two layers travel between the hosting page and the relay:
//!
//! - **System messages** arrive on the frame itself and carry the literal
//!   `"init"` / `"close"` signals. An `"init"` message transfers the message
//!   port used for everything else.
//! - **Requests and responses** travel over that port as JSON objects:
//!   `{ id, method, ...args }` in, `{ id, result }` or `{ id, error }` out.
//!
//! Field names match the page-side client exactly (`isSupported`,
//! `scrambleKey`, `statusList`, ...).

use crate::channel::MessagePort;
use crate::error::RelayError;
use crate::transport::STATUS_OK;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// System message payload that begins a session (must carry a port).
pub const BEGIN_SIGNAL: &str = "init";
/// System message payload that ends the current session.
pub const END_SIGNAL: &str = "close";
/// Notification posted on a freshly adopted port.
pub const READY_SIGNAL: &str = "ready";

/// A top-level message delivered to the frame.
#[derive(Debug)]
pub struct SystemMessage {
    /// Origin of the sending page.
    pub origin: String,
    /// Message payload.
    pub data: Value,
    /// Transferred ports.
    pub ports: Vec<MessagePort>,
}

/// Classification of a [`SystemMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Begin,
    End,
    Unrecognized,
}

impl SystemMessage {
    pub fn new(origin: impl Into<String>, data: Value) -> Self {
        Self {
            origin: origin.into(),
            data,
            ports: Vec::new(),
        }
    }

    /// Attach a transferred port.
    pub fn with_port(mut self, port: MessagePort) -> Self {
        self.ports.push(port);
        self
    }

    pub fn signal(&self) -> Signal {
        match self.data.as_str() {
            Some(BEGIN_SIGNAL) if !self.ports.is_empty() => Signal::Begin,
            Some(END_SIGNAL) => Signal::End,
            _ => Signal::Unrecognized,
        }
    }
}

/// A call decoded from a request, tagged by its `method` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Call {
    IsSupported,
    List,
    Open(OpenArgs),
    Close,
    Send(SendArgs),
}

impl Call {
    /// Method names understood by the relay.
    pub const METHODS: [&'static str; 5] = ["isSupported", "list", "open", "close", "send"];

    pub fn method(&self) -> &'static str {
        match self {
            Call::IsSupported => "isSupported",
            Call::List => "list",
            Call::Open(_) => "open",
            Call::Close => "close",
            Call::Send(_) => "send",
        }
    }
}

/// Arguments for `open`. Missing fields fall back to configured defaults;
/// a missing `path` selects the first enumerated device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenArgs {
    pub path: Option<String>,
    pub is_debug: Option<bool>,
    pub scramble_key: Option<String>,
    /// Exchange timeout in milliseconds.
    pub timeout: Option<u64>,
}

/// Arguments for `send`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendArgs {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Hex-encoded command payload. Required; `""` sends an empty body.
    pub data: String,
    /// Acceptable status words.
    #[serde(default = "default_status_list")]
    pub status_list: Vec<u16>,
}

fn default_status_list() -> Vec<u16> {
    vec![STATUS_OK]
}

/// A decoded request: correlation id plus call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Value,
    pub call: Call,
}

impl Request {
    /// Decode a raw port message.
    ///
    /// The id is extracted before anything else so that a rejected request can
    /// still be answered under its own id (`null` when it has none).
    pub fn parse(raw: Value) -> Result<Request, (Value, RelayError)> {
        let id = raw.get("id").cloned().unwrap_or(Value::Null);

        let method = match raw.get("method") {
            Some(Value::String(m)) => m.clone(),
            Some(other) => {
                return Err((
                    id,
                    RelayError::InvalidRequest(format!("method must be a string, got {other}")),
                ));
            }
            None if raw.is_object() => {
                return Err((id, RelayError::InvalidRequest("missing method".into())));
            }
            None => {
                return Err((
                    id,
                    RelayError::InvalidRequest("request must be a JSON object".into()),
                ));
            }
        };

        if !Call::METHODS.contains(&method.as_str()) {
            return Err((id, RelayError::UnknownMethod(method)));
        }

        match serde_json::from_value::<Call>(raw) {
            Ok(call) => Ok(Request { id, call }),
            Err(e) => Err((
                id,
                RelayError::InvalidRequest(format!("bad arguments for {method}: {e}")),
            )),
        }
    }
}

/// Error details carried in a failed [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&RelayError> for ErrorBody {
    fn from(e: &RelayError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Reply to a request. Serializes as `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: &RelayError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// JSON form posted on the message port.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({
                "id": self.id,
                "error": { "code": "internal", "message": e.to_string() },
            })
        })
    }
}
