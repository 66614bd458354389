//! Agent module
//!
//! This module contains the agent event loop, the events it consumes and the
//! shared connection state.

pub mod events;
pub mod runtime;
pub mod state;
