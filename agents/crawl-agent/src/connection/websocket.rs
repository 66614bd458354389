//! WebSocket Client
//!
//! Owns the transport to the dispatch server: opens it with the session token,
//! forwards inbound frames to the agent queue, writes outbound frames, sends
//! heartbeats while registered and reconnects with backoff after any
//! unexpected close. At most one transport is live at a time.

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::agent::events::AgentEvent;
use crate::agent::state::AgentStateManager;
use crate::connection::outbox::OutboundFrame;
use crate::connection::protocol::ClientMessage;
use crate::error::TransportError;
use crate::identity::IdentityHandle;

/// Commands from the agent loop to the connection task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Connect with this token; a no-op if already connected with it
    Connect { token: String },
    /// Close the transport and forget the token
    Disconnect { reason: String },
    /// Close the transport and stop the task
    Shutdown,
}

/// Delay schedule between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// 0 = retry forever
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial.as_millis() as f64 * factor).min(self.max.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt > self.max_attempts
    }
}

/// How one transport session ended
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Closed by the server or the network; reconnect
    Closed(String),
    /// Explicit disconnect; wait for new credentials
    Disconnected,
    /// A different token arrived; reconnect immediately with it
    Retoken(String),
    /// The server refused the token; wait for new credentials
    Rejected(String),
    /// Stop the task
    Shutdown,
}

/// Build the socket URL carrying the auth token
pub fn socket_url(base: &str, token: &str) -> Result<String, TransportError> {
    let mut url = url::Url::parse(base).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", base, e)))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme '{}'", other))),
    }
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

/// WebSocket client for server communication
pub struct WebSocketClient {
    url: String,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    policy: ReconnectPolicy,
    state: AgentStateManager,
    identity: IdentityHandle,
    events: mpsc::Sender<AgentEvent>,
    outbound: mpsc::Receiver<OutboundFrame>,
    commands: mpsc::Receiver<ConnectionCommand>,
    token: Option<String>,
    attempts: u32,
}

impl WebSocketClient {
    /// Run until shutdown: wait for a token, connect, reconnect on failure
    pub async fn run(mut self) {
        loop {
            let token = match self.token.clone() {
                Some(token) => token,
                None => match self.commands.recv().await {
                    Some(ConnectionCommand::Connect { token }) => {
                        if token.is_empty() {
                            debug!("Ignoring connect without a token");
                        } else {
                            self.token = Some(token);
                        }
                        continue;
                    }
                    Some(ConnectionCommand::Disconnect { .. }) => continue,
                    Some(ConnectionCommand::Shutdown) | None => break,
                },
            };

            let (end, opened) = match self.connect_and_run(&token).await {
                Ok(end) => (end, true),
                Err(e) => {
                    // Only the open itself returns an error
                    error!(error = %e, "WebSocket connection error");
                    (SessionEnd::Closed(e.to_string()), false)
                }
            };

            let reason = match end {
                SessionEnd::Shutdown => {
                    self.notify_closed(opened, "Agent shutting down").await;
                    break;
                }
                SessionEnd::Disconnected => {
                    info!("Disconnected on request");
                    self.token = None;
                    self.attempts = 0;
                    self.notify_closed(opened, "Disconnected").await;
                    continue;
                }
                SessionEnd::Retoken(new_token) => {
                    info!("Token changed, reconnecting");
                    self.token = Some(new_token);
                    self.attempts = 0;
                    self.notify_closed(opened, "Token changed").await;
                    continue;
                }
                SessionEnd::Rejected(reason) => {
                    warn!(%reason, "Server rejected the session token");
                    self.token = None;
                    self.attempts = 0;
                    let _ = self.events.send(AgentEvent::SessionRejected { reason }).await;
                    continue;
                }
                SessionEnd::Closed(reason) => reason,
            };

            self.state.set_disconnected(Some(reason.clone()));
            self.notify_closed(opened, &reason).await;

            self.attempts += 1;
            if self.policy.exhausted(self.attempts) {
                warn!(attempts = self.attempts - 1, "Giving up reconnecting until new credentials arrive");
                self.token = None;
                self.attempts = 0;
                continue;
            }

            self.state.set_reconnecting();
            let delay = self.policy.delay(self.attempts);
            info!(delay_ms = delay.as_millis() as u64, attempt = self.attempts, "Waiting before reconnection attempt");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = self.commands.recv() => match cmd {
                    Some(ConnectionCommand::Connect { token }) if !token.is_empty() => {
                        self.token = Some(token);
                        self.attempts = 0;
                    }
                    Some(ConnectionCommand::Connect { .. }) => {}
                    Some(ConnectionCommand::Disconnect { .. }) => {
                        self.token = None;
                        self.attempts = 0;
                        self.state.set_disconnected(Some("Disconnected while waiting to reconnect".to_string()));
                    }
                    Some(ConnectionCommand::Shutdown) | None => break,
                }
            }
        }

        self.state.set_shutting_down();
        info!("Connection task stopped");
    }

    async fn notify_closed(&self, opened: bool, reason: &str) {
        if opened {
            let _ = self
                .events
                .send(AgentEvent::TransportClosed {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Open one transport and pump it until it ends
    async fn connect_and_run(&mut self, token: &str) -> Result<SessionEnd, TransportError> {
        self.state.set_connecting();

        let url = socket_url(&self.url, token)?;
        info!(url = %self.url, "Connecting to dispatch server");

        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout.as_secs()))??;

        info!("WebSocket connection established, awaiting authentication");
        self.attempts = 0;
        self.state.set_authenticating();
        if self.events.send(AgentEvent::TransportOpened).await.is_err() {
            return Ok(SessionEnd::Shutdown);
        }

        let (mut write, mut read) = ws_stream.split();

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if self.events.send(AgentEvent::Inbound(text)).await.is_err() {
                                break SessionEnd::Shutdown;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("Received ping frame, sending pong");
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break SessionEnd::Closed(format!("Failed to answer ping: {}", e));
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("Received pong frame");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "Received close frame");
                            break close_reason(frame);
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("Received binary message (ignored)");
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "WebSocket error");
                            break SessionEnd::Closed(format!("WebSocket error: {}", e));
                        }
                        None => {
                            info!("WebSocket stream ended");
                            break SessionEnd::Closed("Stream ended".to_string());
                        }
                    }
                }

                outgoing = self.outbound.recv() => {
                    let Some(OutboundFrame { kind, text, ack }) = outgoing else {
                        break SessionEnd::Shutdown;
                    };
                    match write.send(Message::Text(text)).await {
                        Ok(()) => {
                            debug!(kind, "Sent message to server");
                            let _ = ack.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = ack.send(Err(e.to_string()));
                            break SessionEnd::Closed(format!("Send failed: {}", e));
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if !self.state.is_registered() {
                        debug!("Skipping heartbeat, session not registered");
                        continue;
                    }
                    let Some(client_id) = self.identity.get() else {
                        continue;
                    };
                    match ClientMessage::heartbeat().to_frame(&client_id) {
                        Ok(json) => {
                            debug!("Sending heartbeat");
                            if let Err(e) = write.send(Message::Text(json)).await {
                                break SessionEnd::Closed(format!("Heartbeat failed: {}", e));
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to encode heartbeat"),
                    }
                }

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Connect { token: new_token }) => {
                            if new_token.is_empty() || new_token == token {
                                debug!("Already connected, ignoring connect");
                            } else {
                                let _ = write.send(Message::Close(None)).await;
                                break SessionEnd::Retoken(new_token);
                            }
                        }
                        Some(ConnectionCommand::Disconnect { reason }) => {
                            if let Some(client_id) = self.identity.get() {
                                if let Ok(json) = ClientMessage::disconnect(&reason).to_frame(&client_id) {
                                    let _ = write.send(Message::Text(json)).await;
                                }
                            }
                            let _ = write.send(Message::Close(None)).await;
                            break SessionEnd::Disconnected;
                        }
                        Some(ConnectionCommand::Shutdown) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            break SessionEnd::Shutdown;
                        }
                    }
                }
            }
        };

        self.state.set_disconnected(Some(format!("{:?}", end)));
        Ok(end)
    }
}

/// Builder for WebSocketClient
pub struct WebSocketClientBuilder {
    url: String,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    policy: ReconnectPolicy,
    state: AgentStateManager,
    identity: IdentityHandle,
}

impl WebSocketClientBuilder {
    pub fn new(url: &str, state: AgentStateManager, identity: IdentityHandle) -> Self {
        Self {
            url: url.to_string(),
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            policy: ReconnectPolicy::default(),
            state,
            identity,
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(
        self,
        events: mpsc::Sender<AgentEvent>,
        outbound: mpsc::Receiver<OutboundFrame>,
        commands: mpsc::Receiver<ConnectionCommand>,
    ) -> WebSocketClient {
        WebSocketClient {
            url: self.url,
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            policy: self.policy,
            state: self.state,
            identity: self.identity,
            events,
            outbound,
            commands,
            token: None,
            attempts: 0,
        }
    }
}

/// A policy close is how the server refuses a token
fn close_reason(frame: Option<CloseFrame<'_>>) -> SessionEnd {
    match frame {
        Some(frame) if frame.code == CloseCode::Policy => SessionEnd::Rejected(frame.reason.into_owned()),
        _ => SessionEnd::Closed("Server closed connection".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_backs_off_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed_delay_with_unit_multiplier() {
        let policy = ReconnectPolicy {
            multiplier: 1.0,
            ..ReconnectPolicy::default()
        };
        assert_eq!(policy.delay(1), policy.delay(7));
    }

    #[test]
    fn test_max_attempts() {
        let unlimited = ReconnectPolicy::default();
        assert!(!unlimited.exhausted(10_000));

        let limited = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        };
        assert!(!limited.exhausted(3));
        assert!(limited.exhausted(4));
    }

    #[test]
    fn test_socket_url_carries_token() {
        let url = socket_url("ws://localhost:8080/smarteCrawler/ws", "a b+c").unwrap();
        assert_eq!(url, "ws://localhost:8080/smarteCrawler/ws?token=a+b%2Bc");
    }

    #[test]
    fn test_socket_url_rejects_http() {
        assert!(matches!(
            socket_url("http://localhost:8080/ws", "t"),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_schedules_reconnect() {
        let state = AgentStateManager::new();
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (_outbound_tx, outbound_rx) = mpsc::channel(8);
        let (commands_tx, commands_rx) = mpsc::channel(8);

        // Nothing listens on port 1, the open fails immediately
        let client = WebSocketClientBuilder::new("ws://127.0.0.1:1/ws", state.clone(), IdentityHandle::new())
            .connect_timeout(Duration::from_secs(2))
            .reconnect_policy(ReconnectPolicy {
                initial: Duration::from_secs(60),
                ..ReconnectPolicy::default()
            })
            .build(events_tx, outbound_rx, commands_rx);
        let task = tokio::spawn(client.run());

        commands_tx
            .send(ConnectionCommand::Connect { token: "t".to_string() })
            .await
            .unwrap();

        let mut waited = 0;
        while state.current_state() != crate::agent::state::ConnectionState::Reconnecting && waited < 50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += 1;
        }
        assert_eq!(state.current_state(), crate::agent::state::ConnectionState::Reconnecting);

        commands_tx.send(ConnectionCommand::Shutdown).await.unwrap();
        task.await.unwrap();
        assert_eq!(state.current_state(), crate::agent::state::ConnectionState::ShuttingDown);
    }

    #[test]
    fn test_policy_close_rejects_session() {
        let frame = CloseFrame {
            code: CloseCode::Policy,
            reason: "Authentication failed".into(),
        };
        assert!(matches!(close_reason(Some(frame)), SessionEnd::Rejected(r) if r == "Authentication failed"));

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        assert!(matches!(close_reason(Some(normal)), SessionEnd::Closed(_)));
        assert!(matches!(close_reason(None), SessionEnd::Closed(_)));
    }

    mod live {
        use super::*;
        use crate::agent::state::ConnectionState;
        use futures_util::StreamExt;
        use serde_json::Value;
        use tokio::net::{TcpListener, TcpStream};
        use tokio::task::JoinHandle;
        use tokio::time::timeout;
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        use tokio_tungstenite::tungstenite::Message;
        use tokio_tungstenite::{accept_async, WebSocketStream};

        struct Rig {
            listener: TcpListener,
            state: AgentStateManager,
            events: mpsc::Receiver<AgentEvent>,
            commands: mpsc::Sender<ConnectionCommand>,
            _outbound: mpsc::Sender<OutboundFrame>,
            task: JoinHandle<()>,
        }

        impl Rig {
            async fn start(reconnect_after: Duration) -> Self {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let url = format!("ws://{}/ws", listener.local_addr().unwrap());
                let state = AgentStateManager::new();
                let (events_tx, events) = mpsc::channel(16);
                let (outbound, outbound_rx) = mpsc::channel(8);
                let (commands, commands_rx) = mpsc::channel(8);

                let client = WebSocketClientBuilder::new(&url, state.clone(), IdentityHandle::with_id("client_ws"))
                    .heartbeat_interval(Duration::from_millis(50))
                    .reconnect_policy(ReconnectPolicy {
                        initial: reconnect_after,
                        ..ReconnectPolicy::default()
                    })
                    .build(events_tx, outbound_rx, commands_rx);
                let task = tokio::spawn(client.run());
                commands
                    .send(ConnectionCommand::Connect { token: "t1".to_string() })
                    .await
                    .unwrap();

                Self {
                    listener,
                    state,
                    events,
                    commands,
                    _outbound: outbound,
                    task,
                }
            }

            /// Accept the next transport and wait until the client reports it open
            async fn accept(&mut self) -> WebSocketStream<TcpStream> {
                let (stream, _) = timeout(Duration::from_secs(5), self.listener.accept())
                    .await
                    .expect("client never connected")
                    .unwrap();
                let server = accept_async(stream).await.unwrap();
                assert!(matches!(self.next_event().await, AgentEvent::TransportOpened));
                server
            }

            async fn next_event(&mut self) -> AgentEvent {
                timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for an event")
                    .expect("event queue closed")
            }

            async fn wait_for_state(&self, wanted: ConnectionState) {
                for _ in 0..100 {
                    if self.state.current_state() == wanted {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                assert_eq!(self.state.current_state(), wanted);
            }

            async fn stop(self) {
                self.commands.send(ConnectionCommand::Shutdown).await.unwrap();
                self.task.await.unwrap();
            }
        }

        #[tokio::test]
        async fn test_heartbeat_only_after_registration() {
            let mut rig = Rig::start(Duration::from_secs(60)).await;
            let mut server = rig.accept().await;
            assert_eq!(rig.state.current_state(), ConnectionState::Authenticating);

            // Several heartbeat periods pass without a frame
            assert!(timeout(Duration::from_millis(300), server.next()).await.is_err());

            assert!(rig.state.set_registered());
            let frame = timeout(Duration::from_secs(5), server.next())
                .await
                .expect("no heartbeat after registration")
                .unwrap()
                .unwrap();
            let text = match frame {
                Message::Text(text) => text,
                other => panic!("expected a text frame, got {:?}", other),
            };
            let json: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["type"], "heartbeat");
            assert_eq!(json["clientId"], "client_ws");

            rig.stop().await;
        }

        #[tokio::test]
        async fn test_server_close_schedules_reconnect() {
            let mut rig = Rig::start(Duration::from_secs(60)).await;
            let mut server = rig.accept().await;
            rig.state.set_registered();

            server.close(None).await.unwrap();
            assert!(matches!(rig.next_event().await, AgentEvent::TransportClosed { .. }));
            rig.wait_for_state(ConnectionState::Reconnecting).await;

            // No heartbeats reach a closed transport
            assert!(!rig.state.is_registered());
            rig.stop().await;
        }

        #[tokio::test]
        async fn test_policy_close_waits_for_new_credentials() {
            let mut rig = Rig::start(Duration::from_millis(10)).await;
            let mut server = rig.accept().await;

            server
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "Authentication failed".into(),
                }))
                .await
                .unwrap();

            match rig.next_event().await {
                AgentEvent::SessionRejected { reason } => assert_eq!(reason, "Authentication failed"),
                other => panic!("expected a rejected session, got {:?}", other),
            }
            rig.wait_for_state(ConnectionState::Disconnected).await;

            // Well past the reconnect delay, nothing dials in
            assert!(timeout(Duration::from_millis(300), rig.listener.accept()).await.is_err());
            assert_eq!(rig.state.current_state(), ConnectionState::Disconnected);

            // New credentials open a new transport
            rig.commands
                .send(ConnectionCommand::Connect { token: "t2".to_string() })
                .await
                .unwrap();
            let _server = rig.accept().await;
            assert_eq!(rig.state.current_state(), ConnectionState::Authenticating);

            rig.stop().await;
        }
    }
}
