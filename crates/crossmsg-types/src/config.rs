//! Messenger configuration.
//!
//! Every field has a default, so an empty TOML document (or no file at all)
//! yields a usable configuration. Per-call options override these values.

use crate::WILDCARD_ORIGIN;
use serde::{Deserialize, Serialize};

/// Default retransmission interval (milliseconds).
pub const DEFAULT_INTERVAL_MS: u64 = 1_000;

/// Default acknowledgement deadline (milliseconds).
pub const DEFAULT_DEADLINE_MS: u64 = 5_000;

/// Defaults applied by a `Messenger` when a call leaves an option unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// How often an unacknowledged Data envelope is retransmitted.
    pub interval_ms: u64,
    /// How long a sender waits for an Ack before giving up.
    pub deadline_ms: u64,
    /// Origin the peer must have for a transmission to be delivered.
    pub target_origin: String,
    /// Origins a receiver accepts Data envelopes from.
    pub allowed_origins: Vec<String>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            deadline_ms: DEFAULT_DEADLINE_MS,
            target_origin: WILDCARD_ORIGIN.to_string(),
            allowed_origins: vec![WILDCARD_ORIGIN.to_string()],
        }
    }
}
