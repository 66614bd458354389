//! Message Protocol
//!
//! Defines the message types exchanged between the agent and the dispatch
//! server. Every frame is a JSON envelope `{type, payload, clientId, timestamp}`
//! with the timestamp in epoch milliseconds.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::ProtocolError;

/// Messages sent from the agent to the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Registration after authentication
    Register(RegisterPayload),

    /// Liveness message while registered
    Heartbeat(HeartbeatPayload),

    /// Reply to a server ping
    Pong(PongPayload),

    /// Outcome of a crawl task
    CrawlResult(CrawlResultPayload),

    /// The user navigated to a new page
    UrlChange(UrlChangePayload),

    /// Idle/active transition or status report
    IdleStatusUpdate(IdleStatusPayload),

    /// Sent before an explicit disconnect
    ClientDisconnect(DisconnectPayload),
}

/// Messages sent from the server to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Token accepted, session bound
    AuthSuccess(AuthSuccessPayload),

    /// Full (`script_push`) or targeted (`script_designated_push`) script set
    ScriptPush {
        designated: bool,
        payload: ScriptPushPayload,
    },

    /// Run a cached script as a task
    TaskCommand(TaskCommandPayload),

    /// Reconfigure or query the idle tracker
    IdleControl(IdleControlPayload),

    /// Application-level liveness probe
    Ping(PingPayload),

    /// Run a script immediately, optionally with inline content
    ExecuteScript(ExecuteScriptPayload),

    /// Replace the scheduled task set
    ScheduledTaskConfig(ScheduledTaskConfigPayload),

    /// Any type the agent does not know. Logged and dropped.
    Unknown { kind: String },
}

// Agent Message Payloads

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub username: String,
    pub current_url: String,
    pub support_task_types: String,
    pub idle_status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub request_id: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStatus {
    Success,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResultPayload {
    pub task_id: String,
    pub crawl_data: Value,
    pub crawl_status: CrawlStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlChangePayload {
    pub current_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdleStatusPayload {
    pub is_idle: bool,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisconnectPayload {
    pub reason: String,
}

// Server Message Payloads

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessPayload {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptPushPayload {
    pub scripts: Vec<ScriptPayload>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptPayload {
    pub script_id: String,
    #[serde(default)]
    pub domain_pattern: String,
    #[serde(default)]
    pub script_content: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCommandPayload {
    pub task_id: String,
    pub script_id: String,
    #[serde(default)]
    pub execute_on_idle: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdleControlPayload {
    pub command: String,
    /// Milliseconds
    #[serde(default)]
    pub threshold: Option<u64>,
    /// Milliseconds
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Parsed form of an idle control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleCommand {
    SetThreshold(Duration),
    CheckStatus,
    ForceIdleExecution,
    Reset,
    Unknown(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    #[serde(default)]
    pub request_id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteScriptPayload {
    #[serde(default)]
    pub task_id: Option<String>,
    pub script_id: String,
    #[serde(default)]
    pub script_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduledTaskConfigPayload {
    #[serde(default)]
    pub tasks: Vec<ScheduledTaskSpec>,
}

/// A scheduled task as configured on the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTaskSpec {
    pub task_key: String,
    #[serde(default)]
    pub task_name: Option<String>,
    pub script_id: String,
    /// Hostname regex the active page must match
    #[serde(default)]
    pub domain: String,
    /// Milliseconds
    pub interval: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub execute_on_idle: bool,
}

fn default_true() -> bool {
    true
}

/// Tags arrive either as a JSON array or a comma-separated string
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tags {
        List(Vec<String>),
        Csv(String),
    }

    let tags = Option::<Tags>::deserialize(deserializer)?;
    let raw = match tags {
        Some(Tags::List(list)) => list,
        Some(Tags::Csv(csv)) => csv.split(',').map(str::to_string).collect(),
        None => Vec::new(),
    };

    Ok(raw
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(flatten)]
    message: &'a ClientMessage,
    #[serde(rename = "clientId")]
    client_id: &'a str,
    timestamp: i64,
}

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl ClientMessage {
    /// Create a registration message
    pub fn register(username: &str, current_url: &str, task_types: &[String], is_idle: bool) -> Self {
        ClientMessage::Register(RegisterPayload {
            username: username.to_string(),
            current_url: current_url.to_string(),
            support_task_types: task_types.join(","),
            idle_status: is_idle,
        })
    }

    /// Create a heartbeat message
    pub fn heartbeat() -> Self {
        ClientMessage::Heartbeat(HeartbeatPayload {
            timestamp: now_millis(),
        })
    }

    pub fn pong(request_id: Option<Value>) -> Self {
        ClientMessage::Pong(PongPayload {
            request_id: request_id.unwrap_or(Value::Null),
            timestamp: now_millis(),
        })
    }

    pub fn crawl_success(task_id: &str, data: Value) -> Self {
        ClientMessage::CrawlResult(CrawlResultPayload {
            task_id: task_id.to_string(),
            crawl_data: data,
            crawl_status: CrawlStatus::Success,
            error_message: None,
        })
    }

    pub fn crawl_failure(task_id: &str, error: &str) -> Self {
        ClientMessage::CrawlResult(CrawlResultPayload {
            task_id: task_id.to_string(),
            crawl_data: serde_json::json!({ "error": error }),
            crawl_status: CrawlStatus::Fail,
            error_message: Some(error.to_string()),
        })
    }

    pub fn url_change(url: &str) -> Self {
        ClientMessage::UrlChange(UrlChangePayload {
            current_url: url.to_string(),
        })
    }

    pub fn idle_status(is_idle: bool, idle_duration: Option<Duration>) -> Self {
        ClientMessage::IdleStatusUpdate(IdleStatusPayload {
            is_idle,
            timestamp: now_millis(),
            idle_duration: idle_duration.map(|d| d.as_millis() as u64),
        })
    }

    pub fn disconnect(reason: &str) -> Self {
        ClientMessage::ClientDisconnect(DisconnectPayload {
            reason: reason.to_string(),
        })
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register(_) => "register",
            ClientMessage::Heartbeat(_) => "heartbeat",
            ClientMessage::Pong(_) => "pong",
            ClientMessage::CrawlResult(_) => "crawl_result",
            ClientMessage::UrlChange(_) => "url_change",
            ClientMessage::IdleStatusUpdate(_) => "idle_status_update",
            ClientMessage::ClientDisconnect(_) => "client_disconnect",
        }
    }

    /// Serialize the message inside its envelope
    pub fn to_frame(&self, client_id: &str) -> serde_json::Result<String> {
        serde_json::to_string(&OutboundEnvelope {
            message: self,
            client_id,
            timestamp: now_millis(),
        })
    }
}

impl ServerMessage {
    /// Deserialize a message from a JSON text frame
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let envelope: InboundEnvelope = serde_json::from_str(json).map_err(ProtocolError::Malformed)?;
        let kind = envelope.kind;
        let payload = envelope.payload;

        let message = match kind.as_str() {
            "auth_success" => ServerMessage::AuthSuccess(decode(&kind, payload)?),
            "script_push" => ServerMessage::ScriptPush {
                designated: false,
                payload: decode(&kind, payload)?,
            },
            "script_designated_push" => ServerMessage::ScriptPush {
                designated: true,
                payload: decode(&kind, payload)?,
            },
            "task_command" => ServerMessage::TaskCommand(decode(&kind, payload)?),
            "idle_control_command" => ServerMessage::IdleControl(decode(&kind, payload)?),
            "ping" => ServerMessage::Ping(decode(&kind, payload)?),
            "execute_script" => ServerMessage::ExecuteScript(decode(&kind, payload)?),
            "scheduled_task_config" => ServerMessage::ScheduledTaskConfig(decode(&kind, payload)?),
            _ => ServerMessage::Unknown { kind },
        };

        Ok(message)
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &str {
        match self {
            ServerMessage::AuthSuccess(_) => "auth_success",
            ServerMessage::ScriptPush { designated: false, .. } => "script_push",
            ServerMessage::ScriptPush { designated: true, .. } => "script_designated_push",
            ServerMessage::TaskCommand(_) => "task_command",
            ServerMessage::IdleControl(_) => "idle_control_command",
            ServerMessage::Ping(_) => "ping",
            ServerMessage::ExecuteScript(_) => "execute_script",
            ServerMessage::ScheduledTaskConfig(_) => "scheduled_task_config",
            ServerMessage::Unknown { kind } => kind,
        }
    }
}

impl IdleControlPayload {
    pub fn command(&self) -> IdleCommand {
        match self.command.as_str() {
            "set_idle_threshold" | "set_threshold" => match self.threshold.or(self.duration) {
                Some(ms) if ms > 0 => IdleCommand::SetThreshold(Duration::from_millis(ms)),
                _ => IdleCommand::Unknown(format!("{} without a positive threshold", self.command)),
            },
            "check_idle_status" => IdleCommand::CheckStatus,
            "force_idle_execution" | "execute_idle_tasks" => IdleCommand::ForceIdleExecution,
            "reset_idle" => IdleCommand::Reset,
            other => IdleCommand::Unknown(other.to_string()),
        }
    }
}

/// Payload-less messages (`{"type":"ping"}`) decode as an empty object
fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };

    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}
