//! Shared error types for exchange operations.

use std::fmt;
use thiserror::Error;

/// Why an exchange was torn down before reaching its natural terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller cancelled the key.
    Cancelled,
    /// The opposite side of the same key finished and purged this entry.
    PairedCleanup,
    /// The inbound event stream of the hosting context closed.
    ChannelClosed,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::PairedCleanup => write!(f, "purged by paired cleanup"),
            Self::ChannelClosed => write!(f, "inbound channel closed"),
        }
    }
}

/// Every way an exchange can fail.
///
/// `KeyInUse`, `UnresolvedTarget`, `SecurityPolicyViolation` and `OpenFailed`
/// are returned before any envelope is transmitted. The remaining variants
/// settle a pending exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// An outbound exchange for this key is already in flight.
    #[error("An exchange for key \"{key}\" is already in flight")]
    KeyInUse {
        /// The contested key.
        key: String,
    },

    /// No peer context could be located.
    #[error(
        "Could not resolve a target peer for key \"{key}\": pass a peer handle or peer name, \
         and make sure the receiver has announced its name"
    )]
    UnresolvedTarget {
        /// The key of the rejected exchange.
        key: String,
    },

    /// The transmission would violate the origin policy.
    #[error("Security policy violation: {reason}")]
    SecurityPolicyViolation {
        /// Human-readable explanation with a suggested fix.
        reason: String,
    },

    /// The peer context was closed while the exchange was pending.
    #[error("Peer context for key \"{key}\" has been closed")]
    PeerUnreachable {
        /// The key of the failed exchange.
        key: String,
    },

    /// No acknowledgement arrived before the deadline.
    #[error("Timed out waiting for acknowledgement of key \"{key}\" ({deadline_ms}ms)")]
    Timeout {
        /// The key of the failed exchange.
        key: String,
        /// The deadline that elapsed.
        deadline_ms: u64,
    },

    /// A new peer context could not be created.
    #[error("Failed to open peer context: {reason}")]
    OpenFailed {
        /// Human-readable explanation with actionable guidance.
        reason: String,
    },

    /// The exchange was torn down from outside its own state machine.
    #[error("Exchange for key \"{key}\" aborted: {reason}")]
    Aborted {
        /// The key of the aborted exchange.
        key: String,
        /// What tore it down.
        reason: AbortReason,
    },
}

impl ExchangeError {
    /// The key this error refers to, when it carries one.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::KeyInUse { key }
            | Self::UnresolvedTarget { key }
            | Self::PeerUnreachable { key }
            | Self::Timeout { key, .. }
            | Self::Aborted { key, .. } => Some(key),
            Self::SecurityPolicyViolation { .. } | Self::OpenFailed { .. } => None,
        }
    }

    /// Whether this error was produced before any envelope left the context.
    pub fn is_fail_fast(&self) -> bool {
        matches!(
            self,
            Self::KeyInUse { .. }
                | Self::UnresolvedTarget { .. }
                | Self::SecurityPolicyViolation { .. }
                | Self::OpenFailed { .. }
        )
    }
}

/// Alias for Result with ExchangeError.
pub type ExchangeResult<T> = Result<T, ExchangeError>;
