//! Connection State Management
//!
//! Provides the connection state machine and a shared state manager. The
//! WebSocket task and the agent loop both hold a clone; the WebSocket task
//! drives the transport states and the agent loop marks the session
//! registered once the server has authenticated it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Represents the possible states of the server connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport and no connection attempt in progress
    Disconnected,
    /// Opening the WebSocket
    Connecting,
    /// Transport open, waiting for `auth_success`
    Authenticating,
    /// Authenticated and registered, heartbeats flowing
    Registered,
    /// Waiting out the reconnect delay after a failure
    Reconnecting,
    /// Agent is shutting down
    ShuttingDown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Authenticating => write!(f, "Authenticating"),
            ConnectionState::Registered => write!(f, "Registered"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

struct StateInner {
    current: ConnectionState,
    last_registered: Option<DateTime<Utc>>,
    connection_attempts: u32,
}

/// Thread-safe connection state manager
#[derive(Clone)]
pub struct AgentStateManager {
    inner: Arc<RwLock<StateInner>>,
}

impl AgentStateManager {
    /// Create a new state manager starting in Disconnected state
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                current: ConnectionState::Disconnected,
                last_registered: None,
                connection_attempts: 0,
            })),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.read().current
    }

    pub fn last_registered(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_registered
    }

    /// Connection attempts since the last successful registration
    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// Transition to a new state. Returns false for an invalid transition.
    pub fn transition_to(&self, new_state: ConnectionState, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();

        if !Self::is_valid_transition(inner.current, new_state) {
            tracing::debug!(from = %inner.current, to = %new_state, "Rejected state transition");
            return false;
        }

        let old_state = inner.current;
        if old_state == new_state {
            return true;
        }

        inner.current = new_state;

        match new_state {
            ConnectionState::Registered => {
                inner.last_registered = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            ConnectionState::Connecting => {
                inner.connection_attempts += 1;
            }
            _ => {}
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            reason = reason.as_deref().unwrap_or(""),
            "Connection state transition"
        );

        true
    }

    fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
        use ConnectionState::*;

        if from == to {
            return true;
        }

        matches!(
            (from, to),
            (Disconnected, Connecting) |
            (Disconnected, Reconnecting) |
            (Disconnected, ShuttingDown) |
            (Connecting, Authenticating) |
            (Connecting, Disconnected) |
            (Connecting, Reconnecting) |
            (Connecting, ShuttingDown) |
            (Authenticating, Registered) |
            (Authenticating, Disconnected) |
            (Authenticating, Reconnecting) |
            (Authenticating, ShuttingDown) |
            (Registered, Disconnected) |
            (Registered, Reconnecting) |
            (Registered, ShuttingDown) |
            (Reconnecting, Connecting) |
            (Reconnecting, Disconnected) |
            (Reconnecting, ShuttingDown)
        )
    }

    pub fn set_connecting(&self) {
        self.transition_to(ConnectionState::Connecting, Some("Opening transport".to_string()));
    }

    pub fn set_authenticating(&self) {
        self.transition_to(ConnectionState::Authenticating, Some("Transport open".to_string()));
    }

    /// Returns false if the transport is not in the authenticating state
    pub fn set_registered(&self) -> bool {
        self.transition_to(ConnectionState::Registered, Some("Authenticated by server".to_string()))
    }

    pub fn set_disconnected(&self, reason: Option<String>) {
        self.transition_to(ConnectionState::Disconnected, reason);
    }

    pub fn set_reconnecting(&self) {
        self.transition_to(ConnectionState::Reconnecting, Some("Connection lost, reconnecting".to_string()));
    }

    pub fn set_shutting_down(&self) {
        self.transition_to(ConnectionState::ShuttingDown, Some("Shutdown requested".to_string()));
    }

    pub fn is_registered(&self) -> bool {
        self.current_state() == ConnectionState::Registered
    }

    /// True while a transport exists (authenticating or registered)
    pub fn is_connected(&self) -> bool {
        matches!(
            self.current_state(),
            ConnectionState::Authenticating | ConnectionState::Registered
        )
    }
}

impl Default for AgentStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let manager = AgentStateManager::new();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[test]
    fn test_happy_path() {
        let manager = AgentStateManager::new();

        manager.set_connecting();
        manager.set_authenticating();
        assert!(manager.is_connected());
        assert!(!manager.is_registered());

        assert!(manager.set_registered());
        assert!(manager.is_registered());
        assert!(manager.last_registered().is_some());
    }

    #[test]
    fn test_cannot_register_without_transport() {
        let manager = AgentStateManager::new();
        assert!(!manager.set_registered());
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_failure_goes_through_reconnecting() {
        let manager = AgentStateManager::new();
        manager.set_connecting();
        manager.set_authenticating();
        manager.set_registered();

        manager.set_disconnected(Some("closed".to_string()));
        manager.set_reconnecting();
        assert_eq!(manager.current_state(), ConnectionState::Reconnecting);
        assert!(manager.transition_to(ConnectionState::Connecting, None));
    }

    #[test]
    fn test_connection_attempts() {
        let manager = AgentStateManager::new();

        manager.set_connecting();
        assert_eq!(manager.connection_attempts(), 1);

        manager.set_reconnecting();
        manager.set_connecting();
        assert_eq!(manager.connection_attempts(), 2);

        manager.set_authenticating();
        manager.set_registered();
        assert_eq!(manager.connection_attempts(), 0);
    }
}
