//! Connection module
//!
//! This module handles all communication with the dispatch server,
//! including the WebSocket transport, the outbound queue and message protocol
//! handling.

pub mod outbox;
pub mod protocol;
pub mod websocket;
