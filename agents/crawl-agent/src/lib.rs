//! Crawl Agent Library
//!
//! This crate provides the core functionality for the crawl agent: a client
//! that keeps a persistent, authenticated WebSocket session with a dispatch
//! server, caches the scripts the server pushes, and runs them as crawl tasks
//! inside pages supplied by a page host. It also tracks whether the user is
//! idle so that background work can wait for idle periods.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod error;
pub mod executor;
pub mod host;
pub mod identity;
pub mod idle;
pub mod schedule;
pub mod scripts;
pub mod storage;

// Re-exports for convenience
pub use agent::events::{AgentEvent, AgentHandle, AgentStatus};
pub use agent::runtime::{Agent, AgentSettings};
pub use agent::state::{AgentStateManager, ConnectionState};
pub use cli::config::Config;
pub use connection::outbox::Outbox;
pub use connection::protocol::{ClientMessage, ServerMessage};
pub use connection::websocket::{ConnectionCommand, WebSocketClient, WebSocketClientBuilder};
pub use host::{PageHost, PageInfo, StdioHost};
pub use identity::{ClientIdentity, IdentityHandle, IdentityManager, SystemSignals};
pub use scripts::{ScriptCache, ScriptDefinition};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
