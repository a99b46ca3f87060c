//! Execution contexts and the raw one-way channel between them.
//!
//! A [`PeerContext`] is the sender-side view of another execution context:
//! it can post a structured value, report whether the context still exists,
//! and (same-origin only) be inspected. An [`Environment`] is the hosting
//! context itself: it owns the inbound event stream and knows how to locate
//! or create other contexts.
//!
//! The channel is fire-and-forget. A post can be silently dropped (peer not
//! listening yet, origin mismatch) and nothing ever confirms delivery; the
//! exchange protocols on top of it supply that.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use url::Url;

/// Location of a context that has not navigated anywhere yet.
pub const BLANK_LOCATION: &str = "about:blank";

/// Opaque identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(uuid::Uuid);

impl ContextId {
    /// Allocate a new unique context identity.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors at the transmission / introspection boundary.
///
/// These never reach application code: the protocols swallow them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Target context is closed")]
    Closed,
    #[error("Cross-origin introspection blocked")]
    IntrospectionBlocked,
    #[error("Transmission rejected: {0}")]
    Rejected(String),
}

/// Alias for Result with TransportError.
pub type TransportResult<T> = Result<T, TransportError>;

/// What a liveness probe on a peer context could determine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The context still exists.
    Alive,
    /// The context was closed.
    Closed,
    /// The environment refuses to tell.
    Unknown,
}

/// What same-origin introspection reveals about a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSnapshot {
    /// Current location.
    pub location: String,
    /// Document title.
    pub title: String,
    /// Whether the document has any content nodes.
    pub has_content: bool,
}

impl ContextSnapshot {
    /// True for a context that was created a moment ago and never used:
    /// blank location, no title, no content.
    pub fn is_fresh_placeholder(&self) -> bool {
        self.location == BLANK_LOCATION && self.title.is_empty() && !self.has_content
    }
}

/// A reference to another execution context.
pub trait PeerContext: Send + Sync + 'static {
    /// Identity of the referenced context.
    fn context_id(&self) -> ContextId;

    /// Post a structured value. `target_origin` restricts delivery to a peer
    /// whose origin matches it (`"*"` for any). Delivery is not confirmed.
    fn post_message(&self, message: Value, target_origin: &str) -> TransportResult<()>;

    /// Best-effort check whether the context still exists.
    fn liveness(&self) -> Liveness;

    /// Introspect the context. Fails with
    /// [`TransportError::IntrospectionBlocked`] across origins.
    fn inspect(&self) -> TransportResult<ContextSnapshot>;

    /// Close the referenced context.
    fn close(&self);
}

impl fmt::Debug for dyn PeerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerContext").field(&self.context_id()).finish()
    }
}

/// Shared handle to a peer context.
pub type PeerHandle = Arc<dyn PeerContext>;

/// Whether two handles reference the same context.
pub fn same_context(a: &PeerHandle, b: &PeerHandle) -> bool {
    a.context_id() == b.context_id()
}

/// One value delivered over the raw channel.
#[derive(Clone)]
pub struct InboundEvent {
    /// The structured value as posted.
    pub data: Value,
    /// Serialized origin of the posting context (may be empty).
    pub origin: String,
    /// The posting context, as seen from the receiving context.
    pub source: Option<PeerHandle>,
}

impl InboundEvent {
    /// Identity of the posting context, if known.
    pub fn source_id(&self) -> Option<ContextId> {
        self.source.as_ref().map(|s| s.context_id())
    }
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEvent")
            .field("data", &self.data)
            .field("origin", &self.origin)
            .field("source", &self.source_id())
            .finish()
    }
}

/// A scoped listener on a context's inbound events.
///
/// Dropping the subscription detaches the listener.
pub struct Subscription {
    rx: broadcast::Receiver<InboundEvent>,
}

impl Subscription {
    /// Wrap a broadcast receiver.
    pub fn new(rx: broadcast::Receiver<InboundEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next event. Returns `None` once the event stream is
    /// closed. Events lost to buffer overrun are skipped, as a lossy channel
    /// may do anyway.
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Inbound listener lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The hosting execution context.
pub trait Environment: Send + Sync + 'static {
    /// Identity of this context.
    fn context_id(&self) -> ContextId;

    /// Current location, used as the base for relative URLs and to learn the
    /// transport scheme. `None` outside of a located context.
    fn location(&self) -> Option<Url>;

    /// Start listening to inbound events.
    fn subscribe(&self) -> Subscription;

    /// Return the context with this name, creating a blank one if none
    /// exists. `None` if creation is refused.
    fn open_named(&self, name: &str) -> Option<PeerHandle>;

    /// Create a new context navigated to `url`. `None` if creation is
    /// refused (e.g. a popup blocker).
    fn open_url(&self, url: &str, features: Option<&str>) -> Option<PeerHandle>;

    /// The context that created this one, if any.
    fn opener(&self) -> Option<PeerHandle>;

    /// The containing context, if any.
    fn parent(&self) -> Option<PeerHandle>;

    /// The discoverable name of this context (empty when unnamed).
    fn name(&self) -> String;

    /// Assign the discoverable name of this context.
    fn set_name(&self, name: &str);
}
