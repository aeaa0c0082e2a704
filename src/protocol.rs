use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{RelayError, Result};

/// Error text of the failure result synthesised when the executor never answers.
pub const TIMEOUT_ERROR: &str = "Timeout waiting for executor response";

/// Correlation id carried by a command and echoed by its result.
///
/// Clients may use either JSON numbers or strings; the relay assigns
/// string ids of the form `relay-<uuid>` when the client sends none.
/// Numbers are kept as sent, so `1.5` or a `time.time()` stamp echo back
/// unchanged. `1` and `1.0` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(Number),
    Text(String),
}

impl RequestId {
    pub fn generate() -> Self {
        Self::Text(format!("relay-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<Number> for RequestId {
    fn from(value: Number) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A command submitted by a client and handed to the executor.
///
/// `payload` is never interpreted. Unknown top-level fields are kept in
/// `extra` so the executor sees the submission exactly as it was sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "data", default)]
    pub payload: Value,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Command {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            request_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_request_id(mut self, id: impl Into<RequestId>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Outcome of one command, as reported by the executor or synthesised by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<RequestId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandResult {
    pub fn ok(request_id: RequestId, data: Value) -> Self {
        Self {
            request_id: Some(request_id),
            success: true,
            data: Some(data),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn failure(request_id: Option<RequestId>, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(Value::String(error.into())),
            extra: Map::new(),
        }
    }

    pub fn timeout(request_id: RequestId) -> Self {
        Self::failure(Some(request_id), TIMEOUT_ERROR)
    }

    /// Error text when the executor reported a plain string, the JSON text otherwise.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        !self.success && self.error.as_ref().and_then(Value::as_str) == Some(TIMEOUT_ERROR)
    }
}

/// Parse one submission line from a client connection.
pub fn parse_submission(line: &str) -> Result<Command> {
    let command: Command = serde_json::from_str(line.trim())
        .map_err(|error| RelayError::InvalidCommand(error.to_string()))?;
    if command.kind.trim().is_empty() {
        return Err(RelayError::InvalidCommand(
            "command type must not be empty".to_string(),
        ));
    }
    Ok(command)
}

/// Parse a completion body posted by the executor.
pub fn parse_completion(body: &[u8]) -> Result<CommandResult> {
    let result: CommandResult = serde_json::from_slice(body)
        .map_err(|error| RelayError::InvalidResponse(error.to_string()))?;
    if result.request_id.is_none() {
        return Err(RelayError::InvalidResponse(
            "missing requestId".to_string(),
        ));
    }
    Ok(result)
}

/// Failure result for a submission that never made it into the relay.
///
/// The `requestId` is echoed when the line was at least an object carrying a
/// usable one, so a pipelining client can still match the rejection.
pub fn rejection_for(line: &str, error: &RelayError) -> CommandResult {
    let request_id = serde_json::from_str::<Value>(line.trim())
        .ok()
        .and_then(|value| value.get("requestId").cloned())
        .and_then(|value| serde_json::from_value::<RequestId>(value).ok());
    CommandResult::failure(request_id, error.to_string())
}

/// Serialise a frame as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}
