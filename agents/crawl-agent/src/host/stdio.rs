//! Line-delimited JSON page host
//!
//! The browser side runs the agent as a child process and talks to it over
//! stdin/stdout, one JSON object per line. Host events (`{"event": ...}`) come
//! in on stdin; requests (`{"request": ...}`) go out on stdout. Logging must
//! therefore stay on stderr.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::events::AgentEvent;
use crate::connection::protocol::CrawlStatus;
use crate::error::TaskError;
use crate::host::{ExecutionRequest, PageHost, PageInfo};
use crate::idle::ActivityKind;
use crate::scripts::ScriptDefinition;

/// Events reported by the host
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum HostEvent {
    Activity {
        kind: String,
    },
    #[serde(rename_all = "camelCase")]
    Navigated {
        page_id: u64,
        url: String,
        #[serde(default)]
        active: bool,
    },
    #[serde(rename_all = "camelCase")]
    Activated { page_id: u64 },
    #[serde(rename_all = "camelCase")]
    Closed { page_id: u64 },
    #[serde(rename_all = "camelCase")]
    ExecutionResult {
        request_id: String,
        status: CrawlStatus,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ExecuteScript { script_id: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferedScript {
    script_id: String,
    description: Option<String>,
}

/// Requests sent to the host
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
enum HostRequest {
    #[serde(rename_all = "camelCase")]
    Execute {
        request_id: String,
        page_id: u64,
        task_id: String,
        script_id: String,
        script_content: String,
    },
    #[serde(rename_all = "camelCase")]
    OfferScripts {
        page_id: u64,
        hostname: String,
        scripts: Vec<OfferedScript>,
    },
    Status { connected: bool },
}

type PendingResult = oneshot::Sender<Result<Value, TaskError>>;

pub struct StdioHost {
    pages: RwLock<Vec<PageInfo>>,
    active: RwLock<Option<u64>>,
    pending: Mutex<HashMap<String, PendingResult>>,
    out: mpsc::Sender<String>,
}

/// Removes a pending execution when its waiter goes away
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingResult>>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

impl StdioHost {
    /// Create a host whose requests are written to `out`, one line each
    pub fn new(out: mpsc::Sender<String>) -> Self {
        Self {
            pages: RwLock::new(Vec::new()),
            active: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            out,
        }
    }

    /// Attach to the process's stdin/stdout and start forwarding host events
    pub fn spawn(events: mpsc::Sender<AgentEvent>) -> Arc<Self> {
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(line) = out_rx.recv().await {
                let written = async {
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await
                };
                if let Err(e) = written.await {
                    warn!(error = %e, "Failed to write to page host");
                    break;
                }
            }
        });

        let host = Arc::new(Self::new(out_tx));
        tokio::spawn(host.clone().pump(BufReader::new(tokio::io::stdin()), events));
        host
    }

    /// Read host lines until EOF, forwarding the resulting agent events
    pub async fn pump<R>(self: Arc<Self>, reader: R, events: mpsc::Sender<AgentEvent>)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(event) = self.handle_line(&line) {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => {
                    info!("Page host closed its stream");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read from page host");
                    break;
                }
            }
        }

        for (_, waiter) in self.pending.lock().drain() {
            let _ = waiter.send(Err(TaskError::HostUnavailable("page host disconnected".to_string())));
        }
    }

    /// Apply one host line. Returns the agent event it produces, if any.
    pub fn handle_line(&self, line: &str) -> Option<AgentEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let event: HostEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping unreadable page host line");
                return None;
            }
        };

        match event {
            HostEvent::Activity { kind } => match kind.parse::<ActivityKind>() {
                Ok(kind) => Some(AgentEvent::Activity(kind)),
                Err(reason) => {
                    debug!(%reason, "Ignoring activity");
                    None
                }
            },
            HostEvent::Navigated { page_id, url, active } => {
                {
                    let mut pages = self.pages.write();
                    match pages.iter_mut().find(|p| p.page_id == page_id) {
                        Some(page) => page.url = url.clone(),
                        None => pages.push(PageInfo {
                            page_id,
                            url: url.clone(),
                        }),
                    }
                }
                let is_active = active || *self.active.read() == Some(page_id);
                if is_active {
                    *self.active.write() = Some(page_id);
                    Some(AgentEvent::Navigated { url })
                } else {
                    None
                }
            }
            HostEvent::Activated { page_id } => {
                *self.active.write() = Some(page_id);
                self.pages
                    .read()
                    .iter()
                    .find(|p| p.page_id == page_id)
                    .map(|p| AgentEvent::Navigated { url: p.url.clone() })
            }
            HostEvent::Closed { page_id } => {
                self.pages.write().retain(|p| p.page_id != page_id);
                let mut active = self.active.write();
                if *active == Some(page_id) {
                    *active = None;
                }
                None
            }
            HostEvent::ExecutionResult {
                request_id,
                status,
                data,
                error,
            } => {
                let Some(waiter) = self.pending.lock().remove(&request_id) else {
                    debug!(%request_id, "Result for unknown or expired execution");
                    return None;
                };
                let outcome = match status {
                    CrawlStatus::Success => Ok(data),
                    CrawlStatus::Fail => Err(TaskError::Execution(
                        error.unwrap_or_else(|| "script reported failure".to_string()),
                    )),
                };
                let _ = waiter.send(outcome);
                None
            }
            HostEvent::ExecuteScript { script_id } => Some(AgentEvent::ExecuteScript { script_id }),
        }
    }

    async fn write(&self, request: &HostRequest) -> Result<(), TaskError> {
        let line = serde_json::to_string(request).map_err(|e| TaskError::HostUnavailable(e.to_string()))?;
        self.out
            .send(line)
            .await
            .map_err(|_| TaskError::HostUnavailable("page host output closed".to_string()))
    }
}

#[async_trait]
impl PageHost for StdioHost {
    async fn active_page(&self) -> Option<PageInfo> {
        let active = (*self.active.read())?;
        self.pages.read().iter().find(|p| p.page_id == active).cloned()
    }

    async fn open_pages(&self) -> Vec<PageInfo> {
        let active = *self.active.read();
        let mut pages = self.pages.read().clone();
        pages.sort_by_key(|p| Some(p.page_id) != active);
        pages
    }

    async fn execute(&self, page: &PageInfo, request: ExecutionRequest) -> Result<Value, TaskError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        self.write(&HostRequest::Execute {
            request_id,
            page_id: page.page_id,
            task_id: request.task_id,
            script_id: request.script_id,
            script_content: request.content,
        })
        .await?;

        rx.await
            .map_err(|_| TaskError::HostUnavailable("page host stopped before replying".to_string()))?
    }

    async fn offer_scripts(&self, page: &PageInfo, hostname: &str, scripts: &[Arc<ScriptDefinition>]) {
        let request = HostRequest::OfferScripts {
            page_id: page.page_id,
            hostname: hostname.to_string(),
            scripts: scripts
                .iter()
                .map(|s| OfferedScript {
                    script_id: s.script_id.clone(),
                    description: s.description.clone(),
                })
                .collect(),
        };
        if let Err(e) = self.write(&request).await {
            warn!(error = %e, "Failed to offer scripts");
        }
    }

    async fn connection_status(&self, connected: bool) {
        if let Err(e) = self.write(&HostRequest::Status { connected }).await {
            debug!(error = %e, "Failed to report connection status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> (Arc<StdioHost>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(StdioHost::new(tx)), rx)
    }

    #[tokio::test]
    async fn test_navigation_tracks_active_page() {
        let (host, _rx) = host();

        let event = host.handle_line(r#"{"event":"navigated","pageId":1,"url":"https://a.test/","active":true}"#);
        assert!(matches!(event, Some(AgentEvent::Navigated { ref url }) if url == "https://a.test/"));

        // Background pages are tracked but do not count as navigation
        assert!(host
            .handle_line(r#"{"event":"navigated","pageId":2,"url":"https://b.test/"}"#)
            .is_none());

        assert_eq!(host.active_page().await.unwrap().page_id, 1);
        assert_eq!(host.open_pages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_activation_and_close() {
        let (host, _rx) = host();
        host.handle_line(r#"{"event":"navigated","pageId":1,"url":"https://a.test/","active":true}"#);
        host.handle_line(r#"{"event":"navigated","pageId":2,"url":"https://b.test/"}"#);

        let event = host.handle_line(r#"{"event":"activated","pageId":2}"#);
        assert!(matches!(event, Some(AgentEvent::Navigated { ref url }) if url == "https://b.test/"));
        assert_eq!(host.open_pages().await[0].page_id, 2);

        host.handle_line(r#"{"event":"closed","pageId":2}"#);
        assert!(host.active_page().await.is_none());
        assert_eq!(host.open_pages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_activity_lines() {
        let (host, _rx) = host();
        assert!(matches!(
            host.handle_line(r#"{"event":"activity","kind":"keydown"}"#),
            Some(AgentEvent::Activity(ActivityKind::KeyPress))
        ));
        assert!(host.handle_line(r#"{"event":"activity","kind":"focus"}"#).is_none());
        assert!(host.handle_line("garbage").is_none());
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let (host, mut rx) = host();
        let page = PageInfo {
            page_id: 7,
            url: "https://a.test/".to_string(),
        };

        let responder = {
            let host = host.clone();
            tokio::spawn(async move {
                let line = rx.recv().await.unwrap();
                let request: Value = serde_json::from_str(&line).unwrap();
                assert_eq!(request["request"], "execute");
                assert_eq!(request["pageId"], 7);
                let reply = serde_json::json!({
                    "event": "execution_result",
                    "requestId": request["requestId"],
                    "status": "success",
                    "data": {"title": "hello"}
                });
                host.handle_line(&reply.to_string());
            })
        };

        let result = host
            .execute(
                &page,
                ExecutionRequest {
                    task_id: "t1".to_string(),
                    script_id: "s1".to_string(),
                    content: "return 1".to_string(),
                },
            )
            .await;
        responder.await.unwrap();

        assert_eq!(result.unwrap()["title"], "hello");
        assert!(host.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_pump_fails_pending_on_eof() {
        let (host, _rx) = host();
        let (tx, rx) = oneshot::channel();
        host.pending.lock().insert("r1".to_string(), tx);

        let (events_tx, _events_rx) = mpsc::channel(4);
        host.clone().pump(BufReader::new(&b""[..]), events_tx).await;

        assert!(matches!(rx.await.unwrap(), Err(TaskError::HostUnavailable(_))));
    }
}
