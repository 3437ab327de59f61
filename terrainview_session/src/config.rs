// Session configuration.
//
// Everything a peer needs to know before it can host or join: where the
// relay is, how big a room it asks for, how it retries sign-in, which
// datasets are pre-packaged, which layer fields exist, and how it presents
// itself in the roster. Loaded from JSON with every field optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use terrainview_protocol::types::VrMode;

use crate::roster::LocalIdentity;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// `host:port` of the relay.
    pub relay_addr: String,
    /// Clients per room, not counting the host. Used by `host_session`.
    pub max_peers: u32,
    pub sign_in_retry_delay_ms: u64,
    /// `None` retries sign-in forever.
    pub max_sign_in_attempts: Option<u32>,
    /// Dataset URLs that load from local samples instead of downloading.
    pub fast_path_datasets: Vec<String>,
    /// Layer transparency fields the layer sync accepts.
    pub layer_fields: Vec<String>,
    pub display_name: String,
    pub vr_mode: VrMode,
    /// Stable identity for pin ownership. `None` generates a fresh one per
    /// controller.
    pub guid: Option<String>,
    /// Reject pin requests whose claimed guid differs from the roster's.
    pub verify_request_guid: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_addr: "127.0.0.1:7979".into(),
            max_peers: 9,
            sign_in_retry_delay_ms: 1000,
            max_sign_in_attempts: None,
            fast_path_datasets: Vec::new(),
            layer_fields: Vec::new(),
            display_name: String::new(),
            vr_mode: VrMode::Desktop,
            guid: None,
            verify_request_guid: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionConfigError {
    #[error("failed to read session config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session config: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, SessionConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, SessionConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn sign_in_retry_delay(&self) -> Duration {
        Duration::from_millis(self.sign_in_retry_delay_ms)
    }

    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            display_name: self.display_name.clone(),
            vr_mode: self.vr_mode,
        }
    }
}
