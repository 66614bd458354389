//! Page Host
//!
//! The page host is the browsing context the agent works in: it knows which
//! pages are open, reports user activity and navigation, and runs script
//! payloads inside a page. The agent only ever talks to it through
//! [`PageHost`].

pub mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::TaskError;
use crate::scripts::ScriptDefinition;

pub use stdio::StdioHost;

/// An open page in the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub page_id: u64,
    pub url: String,
}

/// A script to run inside a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub script_id: String,
    pub content: String,
}

#[async_trait]
pub trait PageHost: Send + Sync {
    /// The focused page, if any
    async fn active_page(&self) -> Option<PageInfo>;

    /// Every open page, focused one first
    async fn open_pages(&self) -> Vec<PageInfo>;

    /// Run a script in `page` and wait for its single result
    async fn execute(&self, page: &PageInfo, request: ExecutionRequest) -> Result<Value, TaskError>;

    /// Offer scripts matching the page's host to the user
    async fn offer_scripts(&self, page: &PageInfo, hostname: &str, scripts: &[Arc<ScriptDefinition>]);

    /// Binary connected/disconnected indicator
    async fn connection_status(&self, connected: bool);
}
