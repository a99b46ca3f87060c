//! Peer resolution: finding the context a sender should talk to.
//!
//! Resolution is a strategy behind the [`PeerResolver`] trait. The default
//! [`ProbeResolver`] talks to the hosting [`Environment`]; tests can swap in
//! a fixed table instead of creating and closing real contexts.

use crate::peer::{Environment, Liveness, PeerHandle, TransportError};
use std::sync::Arc;
use tracing::debug;

/// How a sender designates its peer.
#[derive(Debug, Clone)]
pub enum PeerTarget {
    /// A handle the caller already holds.
    Handle(PeerHandle),
    /// The discoverable name a receiver announced.
    Name(String),
    /// The context that opened or contains this one.
    Structural,
}

/// Strategy for turning a [`PeerTarget`] into a live handle.
pub trait PeerResolver: Send + Sync + 'static {
    /// Resolve `target`, or `None` if no suitable peer exists.
    fn resolve(&self, target: &PeerTarget) -> Option<PeerHandle>;
}

/// Try an explicit handle, then a name, then the structural relationship.
pub fn resolve_chain(
    resolver: &dyn PeerResolver,
    handle: Option<&PeerHandle>,
    name: Option<&str>,
) -> Option<PeerHandle> {
    if let Some(handle) = handle {
        return resolver.resolve(&PeerTarget::Handle(Arc::clone(handle)));
    }
    if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
        if let Some(found) = resolver.resolve(&PeerTarget::Name(name.to_string())) {
            return Some(found);
        }
    }
    resolver.resolve(&PeerTarget::Structural)
}

/// Resolver that probes the hosting environment.
pub struct ProbeResolver {
    env: Arc<dyn Environment>,
}

impl ProbeResolver {
    /// Create a resolver over `env`.
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env }
    }

    fn is_self(&self, handle: &PeerHandle) -> bool {
        handle.context_id() == self.env.context_id()
    }

    /// Locate an existing context by name.
    ///
    /// The environment's lookup creates a blank context when the name is
    /// unknown, so a fresh placeholder means "no such peer": it is closed
    /// again and reported as absent. When introspection is blocked the
    /// context has already navigated to foreign content, so it cannot be
    /// the placeholder we just created and is accepted.
    fn resolve_name(&self, name: &str) -> Option<PeerHandle> {
        let found = self.env.open_named(name)?;
        if self.is_self(&found) {
            debug!(name, "Name resolves to the current context, ignoring");
            return None;
        }
        match found.inspect() {
            Ok(snapshot) if snapshot.is_fresh_placeholder() => {
                debug!(name, "No context with this name, closing probe placeholder");
                found.close();
                None
            }
            Ok(_) | Err(TransportError::IntrospectionBlocked) => {
                if found.liveness() == Liveness::Closed {
                    None
                } else {
                    Some(found)
                }
            }
            Err(e) => {
                debug!(name, error = %e, "Named context could not be inspected");
                None
            }
        }
    }

    fn resolve_structural(&self) -> Option<PeerHandle> {
        let candidate = self.env.opener().or_else(|| self.env.parent())?;
        if self.is_self(&candidate) {
            return None;
        }
        Some(candidate)
    }
}

impl PeerResolver for ProbeResolver {
    fn resolve(&self, target: &PeerTarget) -> Option<PeerHandle> {
        match target {
            PeerTarget::Handle(handle) => Some(Arc::clone(handle)),
            PeerTarget::Name(name) => self.resolve_name(name),
            PeerTarget::Structural => self.resolve_structural(),
        }
    }
}
