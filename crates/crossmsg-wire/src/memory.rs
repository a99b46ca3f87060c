//! In-process environment: a hub of execution contexts wired together by a
//! lossy one-way channel.
//!
//! A [`MemoryBrowser`] owns every context. A [`MemoryContext`] is the hosting
//! side of one of them and implements [`Environment`]. Handles given out to
//! other contexts are views: the target as seen from a viewer. That is what
//! makes introspection fail across origins and what gives every delivered
//! event a `source` the receiver can reply to.
//!
//! Delivery follows the raw channel's rules: a post whose target origin does
//! not match, or whose target is not listening when it arrives, vanishes
//! without a trace. Every post is recorded so tests can count envelopes.

use crate::message::Envelope;
use crate::origin::{derive_origin, is_wildcard};
use crate::peer::{
    ContextId, ContextSnapshot, Environment, InboundEvent, Liveness, PeerContext, PeerHandle,
    Subscription, TransportError, TransportResult, BLANK_LOCATION,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;
use url::Url;

/// Buffered events per context before slow listeners start lagging.
const INBOX_CAPACITY: usize = 256;

/// One call to `post_message`, as seen by the hub.
#[derive(Debug, Clone)]
pub struct PostRecord {
    /// When the post was made.
    pub at: Instant,
    pub from: ContextId,
    pub to: ContextId,
    pub target_origin: String,
    /// The posted value, if it was an envelope.
    pub envelope: Option<Envelope>,
}

impl PostRecord {
    /// Whether the post carried a Data envelope.
    pub fn is_data(&self) -> bool {
        matches!(self.envelope, Some(Envelope::Data(_)))
    }

    /// Whether the post carried an Ack envelope.
    pub fn is_ack(&self) -> bool {
        matches!(self.envelope, Some(Envelope::Ack(_)))
    }
}

struct ContextState {
    location: String,
    origin: String,
    name: String,
    title: String,
    has_content: bool,
    hide_liveness: bool,
    opener: Option<ContextId>,
    parent: Option<ContextId>,
    /// `None` once the context is closed; dropping the sender ends every
    /// subscription.
    inbox: Option<broadcast::Sender<InboundEvent>>,
}

impl ContextState {
    fn new(location: String, origin: String) -> Self {
        let has_content = location != BLANK_LOCATION;
        let (inbox, _) = broadcast::channel(INBOX_CAPACITY);
        Self {
            location,
            origin,
            name: String::new(),
            title: String::new(),
            has_content,
            hide_liveness: false,
            opener: None,
            parent: None,
            inbox: Some(inbox),
        }
    }

    fn is_closed(&self) -> bool {
        self.inbox.is_none()
    }
}

#[derive(Default)]
struct Hub {
    contexts: HashMap<ContextId, ContextState>,
    /// Creation order, so name lookup is deterministic.
    order: Vec<ContextId>,
    latency: Duration,
    popups_blocked: bool,
    posts: Vec<PostRecord>,
}

impl Hub {
    fn insert(&mut self, state: ContextState) -> ContextId {
        let id = ContextId::new();
        self.contexts.insert(id, state);
        self.order.push(id);
        id
    }

    fn origin_of(&self, id: ContextId) -> String {
        self.contexts
            .get(&id)
            .map(|c| c.origin.clone())
            .unwrap_or_default()
    }
}

/// The hub every in-memory context lives in.
#[derive(Clone, Default)]
pub struct MemoryBrowser {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryBrowser {
    /// An empty browser with no contexts.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn context(&self, id: ContextId) -> MemoryContext {
        MemoryContext {
            id,
            browser: self.clone(),
        }
    }

    fn view(&self, target: ContextId, viewer: ContextId) -> PeerHandle {
        Arc::new(MemoryPeer {
            target,
            viewer,
            hub: Arc::downgrade(&self.hub),
        })
    }

    /// Create a top-level context navigated to `url`.
    pub fn open_context(&self, url: &str) -> MemoryContext {
        let origin = derive_origin(url, None).unwrap_or_default();
        let id = self.lock().insert(ContextState::new(url.to_string(), origin));
        self.context(id)
    }

    /// Number of contexts that are not closed.
    pub fn open_count(&self) -> usize {
        self.lock()
            .contexts
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Delay applied to every delivery.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Refuse (or allow again) the creation of new contexts.
    pub fn block_popups(&self, blocked: bool) {
        self.lock().popups_blocked = blocked;
    }

    /// Every post made so far, oldest first.
    pub fn posts(&self) -> Vec<PostRecord> {
        self.lock().posts.clone()
    }

    /// Posts from `from` to `to`, oldest first.
    pub fn posts_between(&self, from: ContextId, to: ContextId) -> Vec<PostRecord> {
        self.lock()
            .posts
            .iter()
            .filter(|p| p.from == from && p.to == to)
            .cloned()
            .collect()
    }

    /// Contexts whose opener is `opener`, in creation order.
    pub fn opened_by(&self, opener: ContextId) -> Vec<MemoryContext> {
        let hub = self.lock();
        let ids: Vec<ContextId> = hub
            .order
            .iter()
            .copied()
            .filter(|id| hub.contexts.get(id).and_then(|c| c.opener) == Some(opener))
            .collect();
        drop(hub);
        ids.into_iter().map(|id| self.context(id)).collect()
    }

    /// The open context carrying `name`, if any.
    pub fn find_by_name(&self, name: &str) -> Option<MemoryContext> {
        let hub = self.lock();
        let id = find_named(&hub, name)?;
        drop(hub);
        Some(self.context(id))
    }

    fn post(
        &self,
        from: ContextId,
        to: ContextId,
        message: Value,
        target_origin: &str,
    ) -> TransportResult<()> {
        let (latency, origin) = {
            let mut hub = self.lock();
            match hub.contexts.get(&to) {
                Some(state) if !state.is_closed() => {}
                _ => return Err(TransportError::Closed),
            }
            hub.posts.push(PostRecord {
                at: Instant::now(),
                from,
                to,
                target_origin: target_origin.to_string(),
                envelope: Envelope::decode(&message),
            });
            (hub.latency, hub.origin_of(from))
        };

        let target_origin = target_origin.to_string();
        if latency.is_zero() {
            self.deliver(from, to, message, origin, &target_origin);
        } else {
            let browser = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                browser.deliver(from, to, message, origin, &target_origin);
            });
        }
        Ok(())
    }

    fn deliver(
        &self,
        from: ContextId,
        to: ContextId,
        data: Value,
        origin: String,
        target_origin: &str,
    ) {
        let hub = self.lock();
        let Some(target) = hub.contexts.get(&to) else {
            return;
        };
        if !is_wildcard(target_origin) && target.origin != target_origin {
            debug!(%to, target_origin, actual = %target.origin, "Dropped post: origin mismatch");
            return;
        }
        let Some(inbox) = target.inbox.as_ref() else {
            debug!(%to, "Dropped post: target closed");
            return;
        };
        if inbox.receiver_count() == 0 {
            debug!(%to, "Dropped post: target not listening");
            return;
        }
        let event = InboundEvent {
            data,
            origin,
            source: Some(self.view(from, to)),
        };
        let _ = inbox.send(event);
    }
}

fn find_named(hub: &Hub, name: &str) -> Option<ContextId> {
    hub.order.iter().copied().find(|id| {
        hub.contexts
            .get(id)
            .is_some_and(|c| !c.is_closed() && c.name == name)
    })
}

/// The hosting side of one in-memory context.
#[derive(Clone)]
pub struct MemoryContext {
    id: ContextId,
    browser: MemoryBrowser,
}

impl MemoryContext {
    /// Identity of this context.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The browser hosting this context.
    pub fn browser(&self) -> &MemoryBrowser {
        &self.browser
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> Option<R> {
        self.browser.lock().contexts.get_mut(&self.id).map(f)
    }

    /// Serialized origin, empty for an opaque one.
    pub fn origin(&self) -> String {
        self.with_state(|s| s.origin.clone()).unwrap_or_default()
    }

    /// Navigate to `url`, resolved against the current location.
    pub fn navigate(&self, url: &str) {
        self.with_state(|s| {
            let base = Url::parse(&s.location).ok();
            let resolved = resolve_url(url, base.as_ref());
            s.origin = derive_origin(&resolved, None).unwrap_or_default();
            s.has_content = resolved != BLANK_LOCATION;
            s.location = resolved;
        });
    }

    /// Set the document title.
    pub fn set_title(&self, title: &str) {
        self.with_state(|s| s.title = title.to_string());
    }

    /// Mark the document as having content nodes or not.
    pub fn set_content(&self, has_content: bool) {
        self.with_state(|s| s.has_content = has_content);
    }

    /// Make liveness probes on this context answer `Unknown`.
    pub fn hide_liveness(&self, hidden: bool) {
        self.with_state(|s| s.hide_liveness = hidden);
    }

    /// Close the context. Its subscriptions end and posts to it fail.
    pub fn close(&self) {
        self.with_state(|s| s.inbox = None);
    }

    /// Whether the context was closed.
    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.is_closed()).unwrap_or(true)
    }

    /// A handle to `other` as seen from this context.
    pub fn handle_for(&self, other: &MemoryContext) -> PeerHandle {
        self.browser.view(other.id, self.id)
    }

    /// Number of active subscriptions on this context.
    pub fn listener_count(&self) -> usize {
        self.with_state(|s| s.inbox.as_ref().map_or(0, |tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Open a popup at `url` with this context as its opener.
    pub fn open_popup(&self, url: &str) -> Option<MemoryContext> {
        let id = self.create_child(url, false)?;
        Some(self.browser.context(id))
    }

    /// Embed a frame at `url` with this context as its parent.
    pub fn open_frame(&self, url: &str) -> MemoryContext {
        let mut hub = self.browser.lock();
        let base = hub
            .contexts
            .get(&self.id)
            .and_then(|s| Url::parse(&s.location).ok());
        let location = resolve_url(url, base.as_ref());
        let origin = derive_origin(&location, None).unwrap_or_default();
        let mut state = ContextState::new(location, origin);
        state.parent = Some(self.id);
        let id = hub.insert(state);
        drop(hub);
        self.browser.context(id)
    }

    /// Create a context opened by this one. Placeholders inherit the
    /// opener's origin.
    fn create_child(&self, url: &str, placeholder: bool) -> Option<ContextId> {
        let mut hub = self.browser.lock();
        if hub.popups_blocked {
            debug!(url, "Context creation refused: popups blocked");
            return None;
        }
        let creator = hub.contexts.get(&self.id)?;
        let mut state = if placeholder {
            ContextState::new(BLANK_LOCATION.to_string(), creator.origin.clone())
        } else {
            let base = Url::parse(&creator.location).ok();
            let location = resolve_url(url, base.as_ref());
            let origin = derive_origin(&location, None).unwrap_or_default();
            ContextState::new(location, origin)
        };
        state.opener = Some(self.id);
        Some(hub.insert(state))
    }
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("id", &self.id)
            .field("origin", &self.origin())
            .finish()
    }
}

impl Environment for MemoryContext {
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn location(&self) -> Option<Url> {
        self.with_state(|s| Url::parse(&s.location).ok()).flatten()
    }

    fn subscribe(&self) -> Subscription {
        let rx = self
            .with_state(|s| s.inbox.as_ref().map(|tx| tx.subscribe()))
            .flatten();
        // A closed context yields a stream that is already over.
        let rx = rx.unwrap_or_else(|| broadcast::channel(1).1);
        Subscription::new(rx)
    }

    fn open_named(&self, name: &str) -> Option<PeerHandle> {
        let existing = find_named(&self.browser.lock(), name);
        if let Some(id) = existing {
            return Some(self.browser.view(id, self.id));
        }
        let id = self.create_child(BLANK_LOCATION, true)?;
        self.browser.context(id).set_name(name);
        Some(self.browser.view(id, self.id))
    }

    fn open_url(&self, url: &str, features: Option<&str>) -> Option<PeerHandle> {
        debug!(url, features, "Opening context");
        let id = self.create_child(url, false)?;
        Some(self.browser.view(id, self.id))
    }

    fn opener(&self) -> Option<PeerHandle> {
        let opener = self.with_state(|s| s.opener).flatten()?;
        Some(self.browser.view(opener, self.id))
    }

    fn parent(&self) -> Option<PeerHandle> {
        let parent = self.with_state(|s| s.parent).flatten()?;
        Some(self.browser.view(parent, self.id))
    }

    fn name(&self) -> String {
        self.with_state(|s| s.name.clone()).unwrap_or_default()
    }

    fn set_name(&self, name: &str) {
        self.with_state(|s| s.name = name.to_string());
    }
}

/// A context as seen from another one.
struct MemoryPeer {
    target: ContextId,
    viewer: ContextId,
    hub: Weak<Mutex<Hub>>,
}

impl MemoryPeer {
    fn browser(&self) -> Option<MemoryBrowser> {
        self.hub.upgrade().map(|hub| MemoryBrowser { hub })
    }
}

impl PeerContext for MemoryPeer {
    fn context_id(&self) -> ContextId {
        self.target
    }

    fn post_message(&self, message: Value, target_origin: &str) -> TransportResult<()> {
        let browser = self.browser().ok_or(TransportError::Closed)?;
        browser.post(self.viewer, self.target, message, target_origin)
    }

    fn liveness(&self) -> Liveness {
        let Some(browser) = self.browser() else {
            return Liveness::Closed;
        };
        let hub = browser.lock();
        match hub.contexts.get(&self.target) {
            Some(state) if state.hide_liveness => Liveness::Unknown,
            Some(state) if !state.is_closed() => Liveness::Alive,
            _ => Liveness::Closed,
        }
    }

    fn inspect(&self) -> TransportResult<ContextSnapshot> {
        let browser = self.browser().ok_or(TransportError::Closed)?;
        let hub = browser.lock();
        let target = hub
            .contexts
            .get(&self.target)
            .filter(|s| !s.is_closed())
            .ok_or(TransportError::Closed)?;
        if self.viewer != self.target {
            let viewer_origin = hub.origin_of(self.viewer);
            if viewer_origin.is_empty() || viewer_origin != target.origin {
                return Err(TransportError::IntrospectionBlocked);
            }
        }
        Ok(ContextSnapshot {
            location: target.location.clone(),
            title: target.title.clone(),
            has_content: target.has_content,
        })
    }

    fn close(&self) {
        if let Some(browser) = self.browser() {
            browser.context(self.target).close();
        }
    }
}

/// Resolve `url` against `base`, keeping the raw text when neither works.
fn resolve_url(url: &str, base: Option<&Url>) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => base
            .and_then(|b| b.join(url).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| url.to_string()),
    }
}
