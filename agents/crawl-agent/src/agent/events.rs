//! Agent events
//!
//! Everything that can happen to the agent arrives as an [`AgentEvent`] on a
//! single queue and is handled in arrival order by the agent loop.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::TaskError;
use crate::idle::ActivityKind;

/// Default capacity of the agent event queue
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub enum AgentEvent {
    /// A transport was opened; authentication is pending
    TransportOpened,

    /// The transport closed, expectedly or not
    TransportClosed { reason: String },

    /// The server refused the session token
    SessionRejected { reason: String },

    /// A text frame from the server
    Inbound(String),

    /// Qualifying user activity reported by the page host
    Activity(ActivityKind),

    /// The focused page changed or finished loading
    Navigated { url: String },

    /// The user confirmed running an offered script
    ExecuteScript { script_id: String },

    /// A task's execution round trip finished
    TaskFinished {
        task_id: String,
        outcome: Result<Value, TaskError>,
    },

    /// The transport wrote a held crawl result
    ResultDelivered { task_id: String },

    /// A held crawl result was not written and must be queued again
    ResultUndelivered { task_id: String, error: String },

    /// A scheduled task's timer fired
    ScheduleDue { task_key: String },

    /// Credentials became available
    Login { token: String, username: String },

    /// Drop the session and close the transport
    Logout,

    /// Snapshot request
    Status(oneshot::Sender<AgentStatus>),

    Shutdown,
}

/// Point-in-time view of the agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub state: String,
    pub connected: bool,
    /// Connection attempts since the last registration
    pub connection_attempts: u32,
    pub last_registered: Option<DateTime<Utc>>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub active_url: Option<String>,
    pub cached_scripts: Vec<String>,
    pub is_idle: bool,
    pub idle_threshold_secs: u64,
    pub idle_for_secs: Option<u64>,
    pub pending_tasks: usize,
    pub deferred_tasks: usize,
    pub scheduled_tasks: usize,
    /// Crawl results not yet confirmed written to the server
    pub unconfirmed_results: usize,
}

/// Cloneable sender for feeding events into a running agent
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<AgentEvent>,
}

impl AgentHandle {
    pub fn new(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: AgentEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Ask the agent for a status snapshot
    pub async fn status(&self) -> Option<AgentStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(AgentEvent::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn login(&self, token: impl Into<String>, username: impl Into<String>) -> bool {
        self.send(AgentEvent::Login {
            token: token.into(),
            username: username.into(),
        })
        .await
    }

    pub async fn logout(&self) -> bool {
        self.send(AgentEvent::Logout).await
    }

    pub async fn shutdown(&self) -> bool {
        self.send(AgentEvent::Shutdown).await
    }
}
