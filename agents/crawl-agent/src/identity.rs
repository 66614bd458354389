//! Client Identity
//!
//! Derives a stable client identifier from environment signals, persists it,
//! and hands the same value back on every later start. The server uses it to
//! recognise a returning agent, so it only changes on first run or on an
//! explicit reset.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IdentityError;
use crate::storage::{KeyValueStore, KEY_CLIENT_ID, KEY_INSTALLATION_ID};

const FINGERPRINT_PREFIX: &str = "client_";
const FALLBACK_PREFIX: &str = "client_fallback_";

/// How the current identity came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Hashed from the environment signal set
    Fingerprint,
    /// Random identity used when signal collection failed
    Fallback,
    /// Loaded from the store
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub id: String,
    pub derived_from: IdentitySource,
}

/// The signal set an identity is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSignals {
    pub installation_id: String,
    pub user_agent: String,
    pub locale: String,
    pub screen: String,
    pub timezone: String,
    pub storage_flags: String,
    pub gpu: String,
}

impl EnvironmentSignals {
    /// Hash the concatenated signals into an opaque identifier
    pub fn fingerprint(&self) -> String {
        let joined = [
            self.installation_id.as_str(),
            self.user_agent.as_str(),
            self.locale.as_str(),
            self.screen.as_str(),
            self.timezone.as_str(),
            self.storage_flags.as_str(),
            self.gpu.as_str(),
        ]
        .join("|");

        let digest = Sha256::digest(joined.as_bytes());
        format!("{}{}", FINGERPRINT_PREFIX, &hex::encode(digest)[..32])
    }
}

/// Source of environment signals
pub trait SignalSource: Send + Sync {
    fn collect(&self, installation_id: &str, storage_backend: &str) -> Result<EnvironmentSignals, IdentityError>;
}

/// Signals gathered from the local system plus page-host supplied overrides
pub struct SystemSignals {
    screen: String,
    gpu: String,
}

impl SystemSignals {
    pub fn new(screen: impl Into<String>, gpu: impl Into<String>) -> Self {
        Self {
            screen: screen.into(),
            gpu: gpu.into(),
        }
    }
}

impl SignalSource for SystemSignals {
    fn collect(&self, installation_id: &str, storage_backend: &str) -> Result<EnvironmentSignals, IdentityError> {
        let timezone = iana_time_zone::get_timezone()
            .map_err(|e| IdentityError::Signals(format!("timezone: {}", e)))?;

        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_else(|_| "C".to_string());

        let host = hostname::get()
            .map_err(|e| IdentityError::Signals(format!("hostname: {}", e)))?
            .to_string_lossy()
            .to_string();

        Ok(EnvironmentSignals {
            installation_id: installation_id.to_string(),
            user_agent: format!(
                "crawl-agent/{} ({}; {}; {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH,
                host
            ),
            locale,
            screen: self.screen.clone(),
            timezone,
            storage_flags: format!("store={};persistent=true", storage_backend),
            gpu: self.gpu.clone(),
        })
    }
}

/// Shared, read-mostly view of the current client id.
///
/// Written once by the identity manager at startup; read by every outbound send.
#[derive(Debug, Clone, Default)]
pub struct IdentityHandle {
    inner: Arc<RwLock<Option<String>>>,
}

impl IdentityHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let handle = Self::new();
        handle.set(id);
        handle
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().clone()
    }

    pub fn set(&self, id: impl Into<String>) {
        *self.inner.write() = Some(id.into());
    }
}

/// Creates, persists and resets the client identity
pub struct IdentityManager {
    store: Arc<dyn KeyValueStore>,
    signals: Box<dyn SignalSource>,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn KeyValueStore>, signals: Box<dyn SignalSource>) -> Self {
        Self { store, signals }
    }

    /// Return the persisted identity, deriving and persisting one on first run.
    ///
    /// Never fails: store errors are logged and signal failures fall back to a
    /// random identity.
    pub fn get_or_create(&self) -> ClientIdentity {
        match self.store.get(KEY_CLIENT_ID) {
            Ok(Some(id)) if !id.trim().is_empty() => {
                debug!(client_id = %id, "Loaded persisted identity");
                return ClientIdentity {
                    id,
                    derived_from: IdentitySource::Persisted,
                };
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read persisted identity, deriving a new one"),
        }

        self.derive()
    }

    /// Discard the persisted identity and derive a fresh one
    pub fn reset(&self) -> ClientIdentity {
        for key in [KEY_CLIENT_ID, KEY_INSTALLATION_ID] {
            if let Err(e) = self.store.remove(key) {
                warn!(key, error = %e, "Failed to clear identity key");
            }
        }
        info!("Identity reset requested");
        self.derive()
    }

    fn derive(&self) -> ClientIdentity {
        let installation_id = self.installation_id();

        let identity = match self.signals.collect(&installation_id, self.store.backend()) {
            Ok(signals) => ClientIdentity {
                id: signals.fingerprint(),
                derived_from: IdentitySource::Fingerprint,
            },
            Err(e) => {
                warn!(error = %e, "Identity signals unavailable, using fallback identity");
                ClientIdentity {
                    id: format!("{}{}", FALLBACK_PREFIX, Uuid::new_v4().simple()),
                    derived_from: IdentitySource::Fallback,
                }
            }
        };

        if let Err(e) = self.store.set(KEY_CLIENT_ID, &identity.id) {
            warn!(error = %e, "Failed to persist identity, it will not survive a restart");
        }

        info!(client_id = %identity.id, source = ?identity.derived_from, "Derived client identity");
        identity
    }

    fn installation_id(&self) -> String {
        if let Ok(Some(id)) = self.store.get(KEY_INSTALLATION_ID) {
            return id;
        }

        let id = Uuid::new_v4().to_string();
        if let Err(e) = self.store.set(KEY_INSTALLATION_ID, &id) {
            warn!(error = %e, "Failed to persist installation id");
        }
        id
    }
}
