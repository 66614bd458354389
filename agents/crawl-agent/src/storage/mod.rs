//! Local key-value persistence
//!
//! The agent persists exactly two things across restarts: its identity and the
//! last auth token (plus the username that goes with it).

pub mod file_store;
pub mod memory_store;

use thiserror::Error;

pub use file_store::FileStore;
pub use memory_store::MemoryStore;

/// Persisted client identifier
pub const KEY_CLIENT_ID: &str = "client_id";
/// Random per-installation seed used as an identity signal
pub const KEY_INSTALLATION_ID: &str = "installation_id";
/// Last auth token issued by the login endpoint
pub const KEY_AUTH_TOKEN: &str = "auth_token";
/// Username the token belongs to
pub const KEY_USERNAME: &str = "username";

/// Trait for a small string key-value store
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `Ok(None)` when the key is absent
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Short description of the backend, used as an identity signal
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Stored value for '{0}' is not valid UTF-8")]
    Encoding(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
