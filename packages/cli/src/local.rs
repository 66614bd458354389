//! Agent-side local state
//!
//! `crawlctl` shares the agent's data directory so that the token it stores
//! after login is the one the agent connects with, and the client id it sends
//! to the API is the agent's.

use anyhow::{Context, Result};
use std::sync::Arc;

use crawl_agent::storage::{KEY_AUTH_TOKEN, KEY_USERNAME};
use crawl_agent::{ClientIdentity, FileStore, IdentityManager, KeyValueStore, SystemSignals};

use crate::config::Config;

pub struct LocalState {
    store: Arc<FileStore>,
    identity: IdentityManager,
}

impl LocalState {
    /// Open the agent's store as configured by its config file
    pub fn open(config: &Config) -> Result<Self> {
        let agent_config = crawl_agent::Config::load_or_default(config.agent_config())?;

        let store = match &agent_config.agent.data_dir {
            Some(dir) => FileStore::open(dir),
            None => FileStore::open_default(),
        }
        .context("Failed to open agent storage")?;

        Ok(Self::with_store(Arc::new(store), &agent_config))
    }

    pub fn with_store(store: Arc<FileStore>, agent_config: &crawl_agent::Config) -> Self {
        let signals = SystemSignals::new(&agent_config.environment.screen, &agent_config.environment.gpu);
        let identity = IdentityManager::new(store.clone(), Box::new(signals));
        Self { store, identity }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn identity(&self) -> ClientIdentity {
        self.identity.get_or_create()
    }

    pub fn reset_identity(&self) -> ClientIdentity {
        self.identity.reset()
    }

    pub fn token(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(KEY_AUTH_TOKEN)?
            .filter(|t| !t.trim().is_empty()))
    }

    /// Token or an error telling the user to log in
    pub fn require_token(&self) -> Result<String> {
        self.token()?
            .context("Not logged in. Run `crawlctl login` first.")
    }

    pub fn username(&self) -> Result<Option<String>> {
        Ok(self.store.get(KEY_USERNAME)?)
    }

    pub fn save_session(&self, token: &str, username: &str) -> Result<()> {
        self.store.set(KEY_AUTH_TOKEN, token)?;
        self.store.set(KEY_USERNAME, username)?;
        Ok(())
    }

    /// Forget the session. The identity stays.
    pub fn clear_session(&self) -> Result<()> {
        self.store.remove(KEY_AUTH_TOKEN)?;
        self.store.remove(KEY_USERNAME)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(dir: &std::path::Path) -> LocalState {
        let store = Arc::new(FileStore::open(dir).unwrap());
        LocalState::with_store(store, &crawl_agent::Config::default())
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let local = state(dir.path());

        assert!(local.token().unwrap().is_none());
        assert!(local.require_token().is_err());

        local.save_session("jwt", "alice").unwrap();
        assert_eq!(local.require_token().unwrap(), "jwt");
        assert_eq!(local.username().unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_logout_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let local = state(dir.path());
        let before = local.identity();

        local.save_session("jwt", "alice").unwrap();
        local.clear_session().unwrap();

        assert!(local.token().unwrap().is_none());
        assert_eq!(local.identity().id, before.id);
    }
}
