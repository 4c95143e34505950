use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Recipient selector and sender id used by the hub itself.
pub const SERVER_ID: &str = "server";

/// Script name an editor client answers with its current conversation id.
pub const GET_CONVERSATION_ID: &str = "get_conversation_id";

pub const AUX_CONVERSATION_ID: &str = "conversation_id";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("payload must be a JSON object")]
    PayloadNotObject,
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("invalid role")]
    InvalidRole(String),
    #[error("envelope exceeds max size: {size} > {max}")]
    TooLarge { size: usize, max: usize },
    #[error("envelope encode failed: {0}")]
    Encode(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_envelope",
            ProtocolError::PayloadNotObject => "invalid_payload",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::InvalidRole(_) => "invalid_role",
            ProtocolError::TooLarge { .. } => "too_large",
            ProtocolError::Encode(_) => "encode_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    RegisterAck,
    Heartbeat,
    HeartbeatAck,
    AituberReceiveText,
    AgentExecutePrompt,
    AgentStopExecution,
    AgentExecutePromptResult,
    AgentStopExecutionResult,
    AgentStatusChanged,
    AgentCompleted,
    AgentError,
    ComposerSendPrompt,
    ComposerSendPromptResult,
    ComposerQueryStatus,
    ComposerStatusResult,
    ExecuteJs,
    ExecuteJsResult,
    Error,
    /// Any type string the hub does not know; routed by `to`.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Register => "register",
            MessageType::RegisterAck => "register_ack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::AituberReceiveText => "aituber_receive_text",
            MessageType::AgentExecutePrompt => "agent_execute_prompt",
            MessageType::AgentStopExecution => "agent_stop_execution",
            MessageType::AgentExecutePromptResult => "agent_execute_prompt_result",
            MessageType::AgentStopExecutionResult => "agent_stop_execution_result",
            MessageType::AgentStatusChanged => "agent_status_changed",
            MessageType::AgentCompleted => "agent_completed",
            MessageType::AgentError => "agent_error",
            MessageType::ComposerSendPrompt => "composer_send_prompt",
            MessageType::ComposerSendPromptResult => "composer_send_prompt_result",
            MessageType::ComposerQueryStatus => "composer_query_status",
            MessageType::ComposerStatusResult => "composer_status_result",
            MessageType::ExecuteJs => "execute_js",
            MessageType::ExecuteJsResult => "execute_js_result",
            MessageType::Error => "error",
            MessageType::Other(value) => value.as_str(),
        }
    }

    /// The reply type a correlated request of this type is answered with.
    pub fn reply_type(&self) -> Option<MessageType> {
        match self {
            MessageType::ExecuteJs => Some(MessageType::ExecuteJsResult),
            MessageType::AgentExecutePrompt => Some(MessageType::AgentExecutePromptResult),
            MessageType::AgentStopExecution => Some(MessageType::AgentStopExecutionResult),
            MessageType::ComposerSendPrompt => Some(MessageType::ComposerSendPromptResult),
            MessageType::ComposerQueryStatus => Some(MessageType::ComposerStatusResult),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        match self {
            MessageType::ExecuteJsResult
            | MessageType::AgentExecutePromptResult
            | MessageType::AgentStopExecutionResult
            | MessageType::ComposerSendPromptResult
            | MessageType::ComposerStatusResult => true,
            MessageType::Other(value) => value.ends_with("_result"),
            _ => false,
        }
    }

    /// Agent and composer lifecycle notifications observed by command clients.
    pub fn is_lifecycle_notification(&self) -> bool {
        match self {
            MessageType::AgentStatusChanged
            | MessageType::AgentCompleted
            | MessageType::AgentError => true,
            MessageType::Other(value) => {
                (value.starts_with("agent_") || value.starts_with("composer_"))
                    && (value.ends_with("_changed")
                        || value.ends_with("_started")
                        || value.ends_with("_completed")
                        || value.ends_with("_error"))
            }
            _ => false,
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        match value {
            "register" => MessageType::Register,
            "register_ack" => MessageType::RegisterAck,
            "heartbeat" => MessageType::Heartbeat,
            "heartbeat_ack" => MessageType::HeartbeatAck,
            "aituber_receive_text" => MessageType::AituberReceiveText,
            "agent_execute_prompt" => MessageType::AgentExecutePrompt,
            "agent_stop_execution" => MessageType::AgentStopExecution,
            "agent_execute_prompt_result" => MessageType::AgentExecutePromptResult,
            "agent_stop_execution_result" => MessageType::AgentStopExecutionResult,
            "agent_status_changed" => MessageType::AgentStatusChanged,
            "agent_completed" => MessageType::AgentCompleted,
            "agent_error" => MessageType::AgentError,
            "composer_send_prompt" => MessageType::ComposerSendPrompt,
            "composer_send_prompt_result" => MessageType::ComposerSendPromptResult,
            "composer_query_status" => MessageType::ComposerQueryStatus,
            "composer_status_result" => MessageType::ComposerStatusResult,
            "execute_js" => MessageType::ExecuteJs,
            "execute_js_result" => MessageType::ExecuteJsResult,
            "error" => MessageType::Error,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        if value.trim().is_empty() {
            return Err(serde::de::Error::custom("message type cannot be empty"));
        }
        Ok(MessageType::from(value.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    AituberClient,
    CommandClient,
    AgentHook,
    EditorClient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::AituberClient => "aituber_client",
            Role::CommandClient => "command_client",
            Role::AgentHook => "agent_hook",
            Role::EditorClient => "editor_client",
        }
    }

    /// Resolves a `to` selector naming a role, including the short labels
    /// clients use as recipients (`"aituber"`, `"editor"`, ...).
    pub fn from_recipient(label: &str) -> Option<Role> {
        if let Ok(role) = label.parse::<Role>() {
            return Some(role);
        }
        match label.trim().to_lowercase().as_str() {
            "aituber" | "avatar" => Some(Role::AituberClient),
            "command" => Some(Role::CommandClient),
            "hook" | "hooks" => Some(Role::AgentHook),
            "editor" | "inject" => Some(Role::EditorClient),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "aituber_client" => Ok(Role::AituberClient),
            "command_client" => Ok(Role::CommandClient),
            "agent_hook" => Ok(Role::AgentHook),
            "editor_client" | "inject_client" => Ok(Role::EditorClient),
            other => Err(ProtocolError::InvalidRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: i64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: MessageType, from: &str, to: Option<&str>, payload: Value) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: to.map(str::to_string),
            timestamp: now_ms(),
            payload,
        }
    }

    /// An envelope sent by the hub itself.
    pub fn from_server(kind: MessageType, to: &str, payload: Value) -> Self {
        Self::new(kind, SERVER_ID, Some(to), payload)
    }

    /// The `to` selector, or `None` when it is empty or null.
    pub fn recipient(&self) -> Option<&str> {
        self.to
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn request_id(&self) -> Option<&str> {
        self.payload_str("request_id")
    }

    /// Sets a payload field in place, leaving every other field as received.
    pub fn set_payload_field(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.payload {
            map.insert(key.to_string(), value);
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Accepts integer or float millisecond timestamps; script clients commonly
/// send `time.time() * 1000`.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Number(n) => {
            if let Some(value) = n.as_i64() {
                Ok(value)
            } else if let Some(value) = n.as_f64() {
                Ok(value as i64)
            } else {
                Err(serde::de::Error::custom("timestamp out of range"))
            }
        }
        _ => Err(serde::de::Error::custom("expected number for timestamp")),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RegisterPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl RegisterPayload {
    /// Union of `client_types` and the legacy single `client_type`.
    pub fn roles(&self) -> Result<BTreeSet<Role>, ProtocolError> {
        let mut roles = BTreeSet::new();
        let declared = self
            .client_types
            .iter()
            .flatten()
            .chain(self.client_type.iter());
        for label in declared {
            roles.insert(label.parse::<Role>()?);
        }
        if roles.is_empty() {
            return Err(ProtocolError::InvalidRole(String::new()));
        }
        Ok(roles)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AituberTextPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_file: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteJsPayload {
    pub code: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Per-request deadline override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteJsResultPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_id: String,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentExecutePromptPayload {
    #[serde(default)]
    pub agent_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentStopExecutionPayload {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// Composer directives carry editor-specific fields the hub does not inspect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ComposerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LifecyclePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl LifecyclePayload {
    pub fn hook_label(&self) -> Option<&str> {
        self.hook_name.as_deref().or(self.event_type.as_deref())
    }

    pub fn body(&self) -> &str {
        self.text
            .as_deref()
            .or(self.message.as_deref())
            .or(self.status.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplyPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// An envelope's payload validated against its type.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Register(RegisterPayload),
    Heartbeat,
    AituberReceiveText(AituberTextPayload),
    ExecuteJs(ExecuteJsPayload),
    ExecuteJsResult(ExecuteJsResultPayload),
    AgentExecutePrompt(AgentExecutePromptPayload),
    AgentStopExecution(AgentStopExecutionPayload),
    ComposerSendPrompt(ComposerPayload),
    ComposerQueryStatus(ComposerPayload),
    Lifecycle(LifecyclePayload),
    Reply(ReplyPayload),
    Error(ErrorPayload),
    Other,
}

impl Message {
    pub fn decode(envelope: &Envelope) -> Result<Message, ProtocolError> {
        if !envelope.payload.is_object() {
            return Err(ProtocolError::PayloadNotObject);
        }
        let kind = &envelope.kind;
        let message = match kind {
            MessageType::Register => Message::Register(parse_payload(kind, &envelope.payload)?),
            MessageType::Heartbeat => Message::Heartbeat,
            MessageType::AituberReceiveText => {
                Message::AituberReceiveText(parse_payload(kind, &envelope.payload)?)
            }
            MessageType::ExecuteJs => {
                let payload: ExecuteJsPayload = parse_payload(kind, &envelope.payload)?;
                if payload.request_id.trim().is_empty() {
                    return Err(invalid(kind, "missing request_id"));
                }
                Message::ExecuteJs(payload)
            }
            MessageType::ExecuteJsResult => {
                Message::ExecuteJsResult(parse_payload(kind, &envelope.payload)?)
            }
            MessageType::AgentExecutePrompt => {
                Message::AgentExecutePrompt(parse_payload(kind, &envelope.payload)?)
            }
            MessageType::AgentStopExecution => {
                Message::AgentStopExecution(parse_payload(kind, &envelope.payload)?)
            }
            MessageType::ComposerSendPrompt => {
                Message::ComposerSendPrompt(parse_payload(kind, &envelope.payload)?)
            }
            MessageType::ComposerQueryStatus => {
                Message::ComposerQueryStatus(parse_payload(kind, &envelope.payload)?)
            }
            MessageType::Error => Message::Error(parse_payload(kind, &envelope.payload)?),
            other if other.is_lifecycle_notification() => {
                Message::Lifecycle(parse_payload(kind, &envelope.payload)?)
            }
            other if other.is_reply() => Message::Reply(parse_payload(kind, &envelope.payload)?),
            _ => Message::Other,
        };
        Ok(message)
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    kind: &MessageType,
    payload: &Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload.clone()).map_err(|err| invalid(kind, &err.to_string()))
}

fn invalid(kind: &MessageType, reason: &str) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: reason.to_string(),
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or_else(|_| Value::Object(Map::new()))
}

pub fn register_ack(assigned_id: &str, roles: &BTreeSet<Role>) -> Envelope {
    let roles: Vec<&str> = roles.iter().map(Role::as_str).collect();
    Envelope::from_server(
        MessageType::RegisterAck,
        assigned_id,
        serde_json::json!({
            "success": true,
            "assigned_id": assigned_id,
            "roles": roles,
            "server_info": {
                "multi_role": true,
                "version": env!("CARGO_PKG_VERSION"),
                "server_time": now_ms(),
            },
        }),
    )
}

pub fn register_rejected(to: &str, error: &str) -> Envelope {
    Envelope::from_server(
        MessageType::RegisterAck,
        to,
        serde_json::json!({
            "success": false,
            "error": error,
            "server_info": { "multi_role": true },
        }),
    )
}

pub fn heartbeat_ack(to: &str) -> Envelope {
    Envelope::from_server(
        MessageType::HeartbeatAck,
        to,
        serde_json::json!({ "server_time": now_ms() }),
    )
}

pub fn error_envelope(to: &str, code: &str, message: &str, request_id: Option<&str>) -> Envelope {
    let payload = ErrorPayload {
        code: code.to_string(),
        message: message.to_string(),
        request_id: request_id.map(str::to_string),
    };
    Envelope::from_server(MessageType::Error, to, to_value(&payload))
}

/// Synthetic failure result for a correlated request.
pub fn failure_reply(kind: MessageType, to: &str, request_id: &str, error: &str) -> Envelope {
    Envelope::from_server(
        kind,
        to,
        serde_json::json!({
            "success": false,
            "error": error,
            "request_id": request_id,
        }),
    )
}

pub fn register(from: &str, roles: &[Role], conversation_id: Option<&str>) -> Envelope {
    let payload = RegisterPayload {
        client_id: Some(from.to_string()),
        client_types: Some(roles.iter().map(|role| role.as_str().to_string()).collect()),
        client_type: roles.first().map(|role| role.as_str().to_string()),
        platform: Some(std::env::consts::OS.to_string()),
        pid: Some(u64::from(std::process::id())),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        conversation_id: conversation_id.map(str::to_string),
        extra: Map::new(),
    };
    Envelope::new(
        MessageType::Register,
        from,
        Some(SERVER_ID),
        to_value(&payload),
    )
}

pub fn heartbeat(from: &str) -> Envelope {
    Envelope::new(
        MessageType::Heartbeat,
        from,
        Some(SERVER_ID),
        Value::Object(Map::new()),
    )
}

pub fn aituber_text(from: &str, payload: &AituberTextPayload) -> Envelope {
    Envelope::new(
        MessageType::AituberReceiveText,
        from,
        Some("aituber"),
        to_value(payload),
    )
}

pub fn execute_js(from: &str, to: &str, code: &str, request_id: &str) -> Envelope {
    let payload = ExecuteJsPayload {
        code: code.to_string(),
        request_id: request_id.to_string(),
        conversation_id: None,
        timeout_ms: None,
        extra: Map::new(),
    };
    Envelope::new(MessageType::ExecuteJs, from, Some(to), to_value(&payload))
}

pub fn execute_js_result(
    from: &str,
    to: &str,
    request_id: &str,
    outcome: Result<Value, String>,
) -> Envelope {
    let (success, result, error) = match outcome {
        Ok(value) => (true, Some(value), None),
        Err(err) => (false, None, Some(err)),
    };
    let payload = ExecuteJsResultPayload {
        success,
        result,
        error,
        request_id: request_id.to_string(),
        extra: Map::new(),
    };
    Envelope::new(
        MessageType::ExecuteJsResult,
        from,
        Some(to),
        to_value(&payload),
    )
}

pub fn agent_execute_prompt(from: &str, to: &str, payload: &AgentExecutePromptPayload) -> Envelope {
    Envelope::new(
        MessageType::AgentExecutePrompt,
        from,
        Some(to),
        to_value(payload),
    )
}

pub fn agent_stop_execution(from: &str, to: &str, payload: &AgentStopExecutionPayload) -> Envelope {
    Envelope::new(
        MessageType::AgentStopExecution,
        from,
        Some(to),
        to_value(payload),
    )
}

pub fn lifecycle(kind: MessageType, from: &str, payload: &LifecyclePayload) -> Envelope {
    Envelope::new(kind, from, Some("command"), to_value(payload))
}
