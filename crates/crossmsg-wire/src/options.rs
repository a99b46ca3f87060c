//! Per-call options for the messenger operations.
//!
//! Unset fields fall back to the messenger's [`MessengerConfig`].

use crate::peer::PeerHandle;
use crossmsg_types::MessengerConfig;
use std::time::Duration;

/// Smallest interval or deadline a call can ask for.
const MIN_PERIOD_MS: u64 = 1;

/// Options for `initiate_with_retry`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Retransmission interval (milliseconds).
    pub interval_ms: Option<u64>,
    /// Acknowledgement deadline (milliseconds).
    pub deadline_ms: Option<u64>,
    /// Explicit peer. Takes precedence over `peer_name`.
    pub peer_handle: Option<PeerHandle>,
    /// Name the receiver announced.
    pub peer_name: Option<String>,
    /// Origin the peer must have; `"*"` for any.
    pub target_origin: Option<String>,
}

impl SendOptions {
/// Options with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

/// Set the retransmission interval.
    pub fn interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

/// Set the acknowledgement deadline.
    pub fn deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = Some(deadline_ms);
        self
    }

/// Address an explicit peer handle.
    pub fn peer(mut self, handle: PeerHandle) -> Self {
        self.peer_handle = Some(handle);
        self
    }

/// Address the context announced under `name`.
    pub fn peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

/// Restrict delivery and Acks to `origin`.
    pub fn target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = Some(origin.into());
        self
    }

    pub(crate) fn interval(&self, config: &MessengerConfig) -> Duration {
        clamp_ms(self.interval_ms.unwrap_or(config.interval_ms))
    }

    pub(crate) fn deadline(&self, config: &MessengerConfig) -> Duration {
        clamp_ms(self.deadline_ms.unwrap_or(config.deadline_ms))
    }

    pub(crate) fn resolved_target_origin(&self, config: &MessengerConfig) -> String {
        self.target_origin
            .clone()
            .unwrap_or_else(|| config.target_origin.clone())
    }
}

/// Naming request made by a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announce {
    /// Name to give the hosting context.
    pub name: String,
    /// Overwrite a different existing name.
    pub force: bool,
}

/// Options for `await_once`.
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Accepted origins. `None` uses the configured allow-list.
    pub allowed_origins: Option<Vec<String>>,
    /// Only accept Data posted by this context.
    pub expected_peer: Option<PeerHandle>,
    /// Name the hosting context for `peer_name` resolution.
    pub announce_as: Option<Announce>,
}

impl ReceiveOptions {
/// Options with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one origin to the allow-list.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins
            .get_or_insert_with(Vec::new)
            .push(origin.into());
        self
    }

/// Replace the allow-list.
    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = Some(origins.into_iter().map(Into::into).collect());
        self
    }

/// Accept Data only from `handle`.
    pub fn expect_peer(mut self, handle: PeerHandle) -> Self {
        self.expected_peer = Some(handle);
        self
    }

    /// Announce `name` unless the context already has a different one.
    pub fn announce_as(mut self, name: impl Into<String>) -> Self {
        self.announce_as = Some(Announce {
            name: name.into(),
            force: false,
        });
        self
    }

    /// Announce `name`, replacing any existing name.
    pub fn announce_as_forced(mut self, name: impl Into<String>) -> Self {
        self.announce_as = Some(Announce {
            name: name.into(),
            force: true,
        });
        self
    }

    pub(crate) fn resolved_allowed_origins(&self, config: &MessengerConfig) -> Vec<String> {
        self.allowed_origins
            .clone()
            .unwrap_or_else(|| config.allowed_origins.clone())
    }
}

/// Options for `open_peer_and_initiate`.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Timing options. `peer_handle`, `peer_name` and `target_origin` are
    /// ignored: the new context is the peer and its origin is derived from
    /// the URL.
    pub send: SendOptions,
    /// Creation features handed to the environment (size, position, ...).
    pub features: Option<String>,
}

impl OpenOptions {
/// Options with every field unset.
    pub fn new() -> Self {
        Self::default()
    }

/// Set the retransmission interval.
    pub fn interval_ms(mut self, interval_ms: u64) -> Self {
        self.send.interval_ms = Some(interval_ms);
        self
    }

/// Set the acknowledgement deadline.
    pub fn deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.send.deadline_ms = Some(deadline_ms);
        self
    }

/// Creation features for the new context.
    pub fn features(mut self, features: impl Into<String>) -> Self {
        self.features = Some(features.into());
        self
    }
}

fn clamp_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(MIN_PERIOD_MS))
}
