//! Task Executor Bridge
//!
//! Runs script content inside a page and reports the outcome back to the agent
//! loop as [`AgentEvent::TaskFinished`]. The [`PendingTasks`] table is what
//! guarantees a single result per task id: the agent only emits a
//! `crawl_result` for an assignment it can remove from the table.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::events::AgentEvent;
use crate::connection::protocol::{now_millis, TaskCommandPayload};
use crate::error::TaskError;
use crate::host::{ExecutionRequest, PageHost, PageInfo};

/// Default bound on a single execution round trip
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);

const RESTRICTED_PREFIXES: &[(&str, &str)] = &[
    ("chrome://", "browser internal page"),
    ("chrome-extension://", "extension page"),
    ("edge://", "browser internal page"),
    ("about:", "browser internal page"),
    ("devtools://", "developer tools page"),
    ("view-source:", "source view page"),
    ("file://", "local file"),
    ("https://chrome.google.com/webstore", "extension store page"),
    ("https://chromewebstore.google.com", "extension store page"),
];

/// Where an assignment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    /// `task_command` or `execute_script` from the server
    Server,
    /// Dispatched on an idle transition
    Idle,
    /// Fired by a scheduled task timer
    Scheduled,
    /// The user confirmed an offered script
    Manual,
}

impl fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskOrigin::Server => "server",
            TaskOrigin::Idle => "idle",
            TaskOrigin::Scheduled => "scheduled",
            TaskOrigin::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// A request to run one script as one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub script_id: String,
    pub idle_only: bool,
    pub origin: TaskOrigin,
    /// Content sent along with the command, used instead of the cached script
    pub inline_content: Option<String>,
}

impl TaskAssignment {
    pub fn from_command(command: TaskCommandPayload) -> Self {
        Self {
            task_id: command.task_id,
            script_id: command.script_id,
            idle_only: command.execute_on_idle.unwrap_or(false),
            origin: TaskOrigin::Server,
            inline_content: None,
        }
    }

    pub fn idle(script_id: &str) -> Self {
        Self::synthesized(format!("idle_{}_{}", script_id, now_millis()), script_id, TaskOrigin::Idle)
    }

    pub fn manual(script_id: &str) -> Self {
        Self::synthesized(format!("manual_{}_{}", script_id, now_millis()), script_id, TaskOrigin::Manual)
    }

    pub fn scheduled(task_key: &str, script_id: &str) -> Self {
        Self::synthesized(
            format!("scheduled_task_{}_{}", task_key, now_millis()),
            script_id,
            TaskOrigin::Scheduled,
        )
    }

    fn synthesized(task_id: String, script_id: &str, origin: TaskOrigin) -> Self {
        Self {
            task_id,
            script_id: script_id.to_string(),
            idle_only: false,
            origin,
            inline_content: None,
        }
    }
}

/// In-flight and deferred assignments, keyed by task id
#[derive(Debug, Default)]
pub struct PendingTasks {
    running: HashMap<String, TaskAssignment>,
    deferred: VecDeque<TaskAssignment>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.running.contains_key(task_id) || self.deferred.iter().any(|a| a.task_id == task_id)
    }

    /// Track a running assignment. Returns false for a duplicate task id.
    pub fn insert(&mut self, assignment: TaskAssignment) -> bool {
        if self.contains(&assignment.task_id) {
            return false;
        }
        self.running.insert(assignment.task_id.clone(), assignment);
        true
    }

    /// Remove a running assignment; `None` if it already finished
    pub fn complete(&mut self, task_id: &str) -> Option<TaskAssignment> {
        self.running.remove(task_id)
    }

    /// Hold an assignment until the user goes idle. Returns false for a duplicate.
    pub fn defer(&mut self, assignment: TaskAssignment) -> bool {
        if self.contains(&assignment.task_id) {
            return false;
        }
        self.deferred.push_back(assignment);
        true
    }

    pub fn take_deferred(&mut self) -> Vec<TaskAssignment> {
        self.deferred.drain(..).collect()
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }
}

/// Reject pages scripts cannot be injected into
pub fn check_restricted(url: &str) -> Result<(), TaskError> {
    let lower = url.to_ascii_lowercase();
    match RESTRICTED_PREFIXES.iter().find(|(prefix, _)| lower.starts_with(prefix)) {
        Some((_, reason)) => Err(TaskError::RestrictedPage {
            url: url.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Pick the page a task runs in: the focused page, else any open one
pub async fn locate_target(host: &dyn PageHost) -> Result<PageInfo, TaskError> {
    if let Some(page) = host.active_page().await {
        return Ok(page);
    }
    host.open_pages().await.into_iter().next().ok_or(TaskError::NoTarget)
}

#[derive(Clone)]
pub struct TaskExecutor {
    host: Arc<dyn PageHost>,
    timeout: Duration,
    events: mpsc::Sender<AgentEvent>,
}

impl TaskExecutor {
    pub fn new(host: Arc<dyn PageHost>, timeout: Duration, events: mpsc::Sender<AgentEvent>) -> Self {
        Self { host, timeout, events }
    }

    /// Run `content` for `task_id` in the background. The outcome comes back
    /// through the agent event queue.
    pub fn spawn(&self, task_id: &str, script_id: &str, content: String) {
        let executor = self.clone();
        let request = ExecutionRequest {
            task_id: task_id.to_string(),
            script_id: script_id.to_string(),
            content,
        };

        tokio::spawn(async move {
            let task_id = request.task_id.clone();
            let outcome = executor.execute(request).await;
            if executor
                .events
                .send(AgentEvent::TaskFinished { task_id, outcome })
                .await
                .is_err()
            {
                debug!("Agent loop gone, dropping task outcome");
            }
        });
    }

    /// One execution round trip, bounded by the task timeout
    pub async fn execute(&self, request: ExecutionRequest) -> Result<Value, TaskError> {
        let page = locate_target(self.host.as_ref()).await?;
        check_restricted(&page.url)?;

        info!(
            task_id = %request.task_id,
            script_id = %request.script_id,
            page_id = page.page_id,
            "Executing script"
        );

        match tokio::time::timeout(self.timeout, self.host.execute(&page, request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Script execution timed out");
                Err(TaskError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scripts::ScriptDefinition;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scriptable page host for tests
    #[derive(Default)]
    pub struct MockHost {
        pub pages: Mutex<Vec<PageInfo>>,
        pub active: Mutex<Option<u64>>,
        pub reply: Mutex<Option<Result<Value, TaskError>>>,
        pub hang: Mutex<bool>,
        pub executed: Mutex<Vec<ExecutionRequest>>,
        pub offers: Mutex<Vec<(String, Vec<String>)>>,
        pub statuses: Mutex<Vec<bool>>,
    }

    impl MockHost {
        pub fn with_page(url: &str) -> Self {
            let host = Self::default();
            host.pages.lock().push(PageInfo {
                page_id: 1,
                url: url.to_string(),
            });
            *host.active.lock() = Some(1);
            host
        }
    }

    #[async_trait]
    impl PageHost for MockHost {
        async fn active_page(&self) -> Option<PageInfo> {
            let active = (*self.active.lock())?;
            self.pages.lock().iter().find(|p| p.page_id == active).cloned()
        }

        async fn open_pages(&self) -> Vec<PageInfo> {
            self.pages.lock().clone()
        }

        async fn execute(&self, _page: &PageInfo, request: ExecutionRequest) -> Result<Value, TaskError> {
            self.executed.lock().push(request);
            if *self.hang.lock() {
                std::future::pending::<()>().await;
            }
            self.reply
                .lock()
                .clone()
                .unwrap_or_else(|| Ok(serde_json::json!({"ok": true})))
        }

        async fn offer_scripts(&self, _page: &PageInfo, hostname: &str, scripts: &[Arc<ScriptDefinition>]) {
            self.offers.lock().push((
                hostname.to_string(),
                scripts.iter().map(|s| s.script_id.clone()).collect(),
            ));
        }

        async fn connection_status(&self, connected: bool) {
            self.statuses.lock().push(connected);
        }
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            task_id: "t1".to_string(),
            script_id: "s1".to_string(),
            content: "return document.title".to_string(),
        }
    }

    #[test]
    fn test_restricted_pages() {
        assert!(check_restricted("https://shop.example.com/").is_ok());
        assert!(check_restricted("chrome://settings").is_err());
        assert!(check_restricted("about:blank").is_err());
        assert!(check_restricted("FILE:///tmp/x.html").is_err());
        assert!(matches!(
            check_restricted("https://chromewebstore.google.com/detail/x"),
            Err(TaskError::RestrictedPage { .. })
        ));
    }

    #[test]
    fn test_pending_rejects_duplicates() {
        let mut pending = PendingTasks::new();
        let assignment = TaskAssignment::manual("s1");

        assert!(pending.insert(assignment.clone()));
        assert!(!pending.insert(assignment.clone()));
        assert!(!pending.defer(assignment.clone()));

        assert!(pending.complete(&assignment.task_id).is_some());
        assert!(pending.complete(&assignment.task_id).is_none());
    }

    #[test]
    fn test_deferred_drains_in_order() {
        let mut pending = PendingTasks::new();
        for id in ["a", "b"] {
            pending.defer(TaskAssignment {
                task_id: id.to_string(),
                script_id: "s1".to_string(),
                idle_only: true,
                origin: TaskOrigin::Server,
                inline_content: None,
            });
        }

        let ids: Vec<_> = pending.take_deferred().into_iter().map(|a| a.task_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(pending.deferred(), 0);
    }

    #[test]
    fn test_synthesized_task_ids() {
        assert!(TaskAssignment::idle("s1").task_id.starts_with("idle_s1_"));
        assert!(TaskAssignment::manual("s1").task_id.starts_with("manual_s1_"));
        assert!(TaskAssignment::scheduled("daily", "s1")
            .task_id
            .starts_with("scheduled_task_daily_"));
    }

    #[tokio::test]
    async fn test_execute_falls_back_to_open_page() {
        let host = Arc::new(MockHost::with_page("https://a.test/"));
        *host.active.lock() = None;
        let (tx, _rx) = mpsc::channel(4);
        let executor = TaskExecutor::new(host.clone(), DEFAULT_TASK_TIMEOUT, tx);

        assert!(executor.execute(request()).await.is_ok());
        assert_eq!(host.executed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_without_pages() {
        let host = Arc::new(MockHost::default());
        let (tx, _rx) = mpsc::channel(4);
        let executor = TaskExecutor::new(host, DEFAULT_TASK_TIMEOUT, tx);

        assert_eq!(executor.execute(request()).await.unwrap_err(), TaskError::NoTarget);
    }

    #[tokio::test]
    async fn test_execute_refuses_restricted_page() {
        let host = Arc::new(MockHost::with_page("chrome://extensions"));
        let (tx, _rx) = mpsc::channel(4);
        let executor = TaskExecutor::new(host.clone(), DEFAULT_TASK_TIMEOUT, tx);

        assert!(matches!(
            executor.execute(request()).await,
            Err(TaskError::RestrictedPage { .. })
        ));
        assert!(host.executed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_reports_timeout() {
        let host = Arc::new(MockHost::with_page("https://a.test/"));
        *host.hang.lock() = true;
        let (tx, mut rx) = mpsc::channel(4);
        let executor = TaskExecutor::new(host, Duration::from_secs(5), tx);

        executor.spawn("t1", "s1", "while(true){}".to_string());

        match rx.recv().await {
            Some(AgentEvent::TaskFinished { task_id, outcome }) => {
                assert_eq!(task_id, "t1");
                assert_eq!(outcome.unwrap_err(), TaskError::Timeout(5));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
