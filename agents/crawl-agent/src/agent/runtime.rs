//! Agent loop
//!
//! [`Agent`] owns all mutable agent state and handles [`AgentEvent`]s one at
//! a time, in arrival order. Inbound server frames are routed here, so a
//! script push is fully applied before the next queued event is looked at.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::agent::events::{AgentEvent, AgentHandle, AgentStatus};
use crate::agent::state::AgentStateManager;
use crate::connection::outbox::Outbox;
use crate::connection::protocol::{
    AuthSuccessPayload, ClientMessage, ExecuteScriptPayload, IdleCommand, IdleControlPayload, ScriptPushPayload,
    ServerMessage,
};
use crate::connection::websocket::ConnectionCommand;
use crate::error::TaskError;
use crate::executor::{PendingTasks, TaskAssignment, TaskExecutor, TaskOrigin, DEFAULT_TASK_TIMEOUT};
use crate::host::PageHost;
use crate::identity::IdentityHandle;
use crate::idle::{IdleTracker, IdleTransition, DEFAULT_IDLE_THRESHOLD};
use crate::schedule::Scheduler;
use crate::scripts::{host_of, ScriptCache, ScriptDefinition};

/// Agent tunables taken from the config file
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub supported_task_types: Vec<String>,
    pub task_timeout: Duration,
    pub idle_threshold: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            supported_task_types: Vec::new(),
            task_timeout: DEFAULT_TASK_TIMEOUT,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
}

/// A crawl result kept until the transport confirms the write
struct HeldResult {
    message: ClientMessage,
    in_flight: bool,
}

pub struct Agent {
    settings: AgentSettings,
    state: AgentStateManager,
    identity: IdentityHandle,
    outbox: Outbox,
    connection: mpsc::Sender<ConnectionCommand>,
    host: Arc<dyn PageHost>,
    executor: TaskExecutor,
    events_tx: mpsc::Sender<AgentEvent>,
    events_rx: mpsc::Receiver<AgentEvent>,
    scripts: ScriptCache,
    idle: IdleTracker,
    pending: PendingTasks,
    scheduler: Scheduler,
    session: Option<Session>,
    active_url: Option<String>,
    results: HashMap<String, HeldResult>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        state: AgentStateManager,
        identity: IdentityHandle,
        outbox: Outbox,
        connection: mpsc::Sender<ConnectionCommand>,
        host: Arc<dyn PageHost>,
        events: (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>),
    ) -> Self {
        let (events_tx, events_rx) = events;
        let executor = TaskExecutor::new(host.clone(), settings.task_timeout, events_tx.clone());
        let idle = IdleTracker::new(settings.idle_threshold, Instant::now());
        let scheduler = Scheduler::new(events_tx.clone());

        Self {
            settings,
            state,
            identity,
            outbox,
            connection,
            host,
            executor,
            events_tx,
            events_rx,
            scripts: ScriptCache::new(),
            idle,
            pending: PendingTasks::new(),
            scheduler,
            session: None,
            active_url: None,
            results: HashMap::new(),
        }
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle::new(self.events_tx.clone())
    }

    /// Process events until shutdown
    pub async fn run(mut self) {
        info!(
            idle_threshold_secs = self.idle.threshold().as_secs(),
            task_timeout_secs = self.settings.task_timeout.as_secs(),
            "Agent loop started"
        );

        loop {
            let deadline = self.idle.deadline();
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(AgentEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
                _ = wait_for(deadline) => self.check_idle(),
            }
        }

        info!("Agent shutting down");
        self.scheduler.clear();
        if self.connection.send(ConnectionCommand::Shutdown).await.is_err() {
            debug!("Connection task already stopped");
        }
    }

    async fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::TransportOpened => {
                debug!("Transport open, waiting for authentication");
                self.flush_results();
            }
            AgentEvent::TransportClosed { reason } => {
                warn!(%reason, "Lost connection to server");
                self.host.connection_status(false).await;
            }
            AgentEvent::SessionRejected { reason } => {
                warn!(%reason, "Session rejected, log in again with crawlctl");
                self.session = None;
                self.host.connection_status(false).await;
            }
            AgentEvent::Inbound(text) => self.dispatch(&text).await,
            AgentEvent::Activity(kind) => {
                debug!(?kind, "User activity");
                self.on_activity();
            }
            AgentEvent::Navigated { url } => self.on_navigated(url).await,
            AgentEvent::ExecuteScript { script_id } => {
                info!(%script_id, "User requested script execution");
                self.start_task(TaskAssignment::manual(&script_id));
            }
            AgentEvent::TaskFinished { task_id, outcome } => self.finish_task(&task_id, outcome),
            AgentEvent::ResultDelivered { task_id } => {
                if self.results.remove(&task_id).is_some() {
                    debug!(%task_id, "Crawl result delivered");
                }
                self.flush_results();
            }
            AgentEvent::ResultUndelivered { task_id, error } => {
                if let Some(held) = self.results.get_mut(&task_id) {
                    warn!(%task_id, %error, "Crawl result not written, queueing again");
                    held.in_flight = false;
                    self.send_result(&task_id);
                }
            }
            AgentEvent::ScheduleDue { task_key } => self.run_scheduled(&task_key).await,
            AgentEvent::Login { token, username } => {
                info!(%username, "Session credentials received");
                self.session = Some(Session { username });
                self.command(ConnectionCommand::Connect { token }).await;
            }
            AgentEvent::Logout => {
                info!("Logging out");
                self.session = None;
                self.command(ConnectionCommand::Disconnect {
                    reason: "logout".to_string(),
                })
                .await;
                self.host.connection_status(false).await;
            }
            AgentEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
            AgentEvent::Shutdown => {}
        }
    }

    /// Route one inbound frame
    async fn dispatch(&mut self, text: &str) {
        let message = match ServerMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed server message");
                return;
            }
        };

        debug!(kind = message.kind(), "Received server message");

        match message {
            ServerMessage::AuthSuccess(payload) => self.on_auth_success(payload).await,
            ServerMessage::ScriptPush { designated, payload } => self.on_script_push(designated, payload),
            ServerMessage::TaskCommand(command) => {
                info!(task_id = %command.task_id, script_id = %command.script_id, "Task assigned");
                self.start_task(TaskAssignment::from_command(command));
            }
            ServerMessage::IdleControl(payload) => self.on_idle_control(payload),
            ServerMessage::Ping(ping) => self.send(ClientMessage::pong(ping.request_id)),
            ServerMessage::ExecuteScript(payload) => self.on_execute_script(payload),
            ServerMessage::ScheduledTaskConfig(config) => {
                info!(count = config.tasks.len(), "Scheduled task configuration received");
                self.scheduler.replace(config.tasks);
            }
            ServerMessage::Unknown { kind } => {
                warn!(%kind, "Ignoring unknown message type");
            }
        }
    }

    async fn on_auth_success(&mut self, payload: AuthSuccessPayload) {
        let local = self.identity.get();
        if let Some(server_id) = payload.client_id {
            if local.as_deref() != Some(server_id.as_str()) {
                warn!(
                    local = local.as_deref().unwrap_or("<none>"),
                    server = %server_id,
                    "Server reported a different client id, keeping local identity"
                );
            }
        }

        if !self.state.set_registered() {
            warn!(state = %self.state.current_state(), "auth_success outside of authentication, ignored");
            return;
        }

        self.host.connection_status(true).await;

        let username = self.session.as_ref().map(|s| s.username.clone()).unwrap_or_default();
        let current_url = self.current_url().await;
        info!(%username, %current_url, "Authenticated, registering");

        self.send(ClientMessage::register(
            &username,
            &current_url,
            &self.settings.supported_task_types,
            self.idle.is_idle(),
        ));
    }

    fn on_script_push(&mut self, designated: bool, payload: ScriptPushPayload) {
        let scripts: Vec<ScriptDefinition> = payload.scripts.into_iter().map(ScriptDefinition::from).collect();
        info!(count = scripts.len(), designated, "Script push received");
        self.scripts.apply_push(scripts);
    }

    fn on_execute_script(&mut self, payload: ExecuteScriptPayload) {
        let mut assignment = match payload.task_id {
            Some(task_id) => TaskAssignment {
                task_id,
                script_id: payload.script_id,
                idle_only: false,
                origin: TaskOrigin::Server,
                inline_content: None,
            },
            None => TaskAssignment::manual(&payload.script_id),
        };
        assignment.inline_content = payload.script_content.filter(|c| !c.is_empty());
        self.start_task(assignment);
    }

    fn on_idle_control(&mut self, payload: IdleControlPayload) {
        match payload.command() {
            IdleCommand::SetThreshold(threshold) => {
                if self.idle.set_threshold(threshold) {
                    info!(threshold_ms = threshold.as_millis() as u64, "Idle threshold updated");
                }
            }
            IdleCommand::CheckStatus => {
                let idle_for = self.idle.idle_duration(Instant::now());
                self.send(ClientMessage::idle_status(self.idle.is_idle(), idle_for));
            }
            IdleCommand::ForceIdleExecution => {
                info!("Forced idle execution");
                self.run_idle_scripts();
            }
            IdleCommand::Reset => self.on_activity(),
            IdleCommand::Unknown(command) => {
                warn!(%command, "Ignoring unknown idle command");
            }
        }
    }

    fn on_activity(&mut self) {
        if let Some(IdleTransition::BecameActive { idle_for }) = self.idle.record_activity(Instant::now()) {
            self.send(ClientMessage::idle_status(false, Some(idle_for)));
        }
    }

    fn check_idle(&mut self) {
        if let Some(IdleTransition::BecameIdle { .. }) = self.idle.poll(Instant::now()) {
            self.send(ClientMessage::idle_status(true, None));
            self.run_idle_scripts();

            let deferred = self.pending.take_deferred();
            if !deferred.is_empty() {
                info!(count = deferred.len(), "Dispatching deferred idle tasks");
            }
            for assignment in deferred {
                self.start_task(assignment);
            }
        }
    }

    fn run_idle_scripts(&mut self) {
        let eligible = self.scripts.idle_eligible();
        debug!(count = eligible.len(), "Idle-eligible scripts");
        for script in eligible {
            self.start_task(TaskAssignment::idle(&script.script_id));
        }
    }

    async fn on_navigated(&mut self, url: String) {
        debug!(%url, "Navigation");
        self.active_url = Some(url.clone());

        if self.state.is_registered() {
            self.send(ClientMessage::url_change(&url));
        }

        let Some(hostname) = host_of(&url) else {
            return;
        };
        let candidates = self.scripts.match_host(&hostname);
        if candidates.is_empty() {
            return;
        }

        if let Some(page) = self.host.active_page().await {
            info!(%hostname, count = candidates.len(), "Offering matching scripts");
            self.host.offer_scripts(&page, &hostname, &candidates).await;
        }
    }

    async fn run_scheduled(&mut self, task_key: &str) {
        let Some(spec) = self.scheduler.get(task_key).cloned() else {
            debug!(%task_key, "Timer fired for a removed scheduled task");
            return;
        };

        if spec.execute_on_idle && !self.idle.is_idle() {
            debug!(%task_key, "User active, scheduled task skipped");
            return;
        }

        let Some(hostname) = self.host.active_page().await.and_then(|p| host_of(&p.url)) else {
            debug!(%task_key, "No active page, scheduled task skipped");
            return;
        };

        if !self.scheduler.matches_host(task_key, &hostname) {
            debug!(%task_key, %hostname, "Active page does not match, scheduled task skipped");
            return;
        }

        if self.scripts.get(&spec.script_id).is_none() {
            warn!(%task_key, script_id = %spec.script_id, "Scheduled script not cached, skipped");
            return;
        }

        self.start_task(TaskAssignment::scheduled(task_key, &spec.script_id));
    }

    /// Accept an assignment: defer it, fail it, or hand it to the executor
    fn start_task(&mut self, assignment: TaskAssignment) {
        if self.pending.contains(&assignment.task_id) {
            warn!(task_id = %assignment.task_id, "Duplicate task id, ignored");
            return;
        }

        if assignment.idle_only && !self.idle.is_idle() {
            info!(task_id = %assignment.task_id, "Deferring idle-only task until the user is idle");
            self.pending.defer(assignment);
            return;
        }

        let content = assignment
            .inline_content
            .clone()
            .or_else(|| self.scripts.get(&assignment.script_id).map(|s| s.content.clone()));

        let task_id = assignment.task_id.clone();
        let script_id = assignment.script_id.clone();
        let origin = assignment.origin;
        self.pending.insert(assignment);

        match content {
            Some(content) => {
                debug!(%task_id, %script_id, %origin, "Dispatching task");
                self.executor.spawn(&task_id, &script_id, content);
            }
            None => self.finish_task(&task_id, Err(TaskError::ScriptNotFound(script_id))),
        }
    }

    fn finish_task(&mut self, task_id: &str, outcome: Result<serde_json::Value, TaskError>) {
        let Some(assignment) = self.pending.complete(task_id) else {
            debug!(%task_id, "Result for a task that is no longer pending");
            return;
        };

        let message = match outcome {
            Ok(data) => {
                info!(%task_id, origin = %assignment.origin, "Task succeeded");
                ClientMessage::crawl_success(task_id, data)
            }
            Err(e) => {
                warn!(%task_id, origin = %assignment.origin, error = %e, "Task failed");
                ClientMessage::crawl_failure(task_id, &e.to_string())
            }
        };
        self.results.insert(
            task_id.to_string(),
            HeldResult {
                message,
                in_flight: false,
            },
        );
        self.send_result(task_id);
    }

    /// Queue a held result and watch its write acknowledgment. A result the
    /// outbox refuses stays held until the next transport open.
    fn send_result(&mut self, task_id: &str) {
        let Some(held) = self.results.get_mut(task_id) else {
            return;
        };
        if held.in_flight {
            return;
        }

        match self.outbox.send(held.message.clone()) {
            Ok(delivery) => {
                held.in_flight = true;
                let events = self.events_tx.clone();
                let task_id = task_id.to_string();
                tokio::spawn(async move {
                    let event = match delivery.confirmed().await {
                        Ok(()) => AgentEvent::ResultDelivered { task_id },
                        Err(e) => AgentEvent::ResultUndelivered {
                            task_id,
                            error: e.to_string(),
                        },
                    };
                    let _ = events.send(event).await;
                });
            }
            Err(e) => warn!(%task_id, error = %e, "Holding crawl result until it can be queued"),
        }
    }

    fn flush_results(&mut self) {
        let waiting: Vec<String> = self
            .results
            .iter()
            .filter(|(_, held)| !held.in_flight)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in waiting {
            self.send_result(&task_id);
        }
    }

    /// Best-effort URL of the page the user is on
    async fn current_url(&self) -> String {
        if let Some(page) = self.host.active_page().await {
            return page.url;
        }
        if let Some(page) = self.host.open_pages().await.into_iter().next() {
            return page.url;
        }
        self.active_url.clone().unwrap_or_default()
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            state: self.state.current_state().to_string(),
            connected: self.state.is_registered(),
            connection_attempts: self.state.connection_attempts(),
            last_registered: self.state.last_registered(),
            client_id: self.identity.get(),
            username: self.session.as_ref().map(|s| s.username.clone()),
            active_url: self.active_url.clone(),
            cached_scripts: self.scripts.script_ids(),
            is_idle: self.idle.is_idle(),
            idle_threshold_secs: self.idle.threshold().as_secs(),
            idle_for_secs: self.idle.idle_duration(Instant::now()).map(|d| d.as_secs()),
            pending_tasks: self.pending.running(),
            deferred_tasks: self.pending.deferred(),
            scheduled_tasks: self.scheduler.len(),
            unconfirmed_results: self.results.len(),
        }
    }

    fn send(&self, message: ClientMessage) {
        let kind = message.kind();
        if let Err(e) = self.outbox.send(message) {
            error!(kind, error = %e, "Failed to queue outbound message");
        }
    }

    async fn command(&self, command: ConnectionCommand) {
        if self.connection.send(command).await.is_err() {
            error!("Connection task is not running");
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
