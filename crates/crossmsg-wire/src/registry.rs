//! Exchange registry: tracks the active exchanges of one messenger.
//!
//! Each logical key owns a slot holding at most one outbound and at most one
//! inbound exchange. A side that reaches a terminal state removes the whole
//! slot (paired cleanup).
//!
//! Every entry carries the sending half of an abort signal. Removing an entry
//! on behalf of someone else fires that signal, which is how the task driving
//! the entry learns it has been purged.

use crate::peer::ContextId;
use crate::receiver::PendingReceive;
use chrono::{DateTime, Utc};
use crossmsg_types::{AbortReason, ExchangeError, ExchangeResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Registry-unique identity of one exchange.
pub type ExchangeId = u64;

/// Which side of a key an exchange occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Outbound,
    Inbound,
}

/// Read-only view of a registered exchange.
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    pub key: String,
    pub side: Side,
    pub id: ExchangeId,
    /// Peer of an outbound exchange.
    pub peer: Option<ContextId>,
    pub started_at: DateTime<Utc>,
}

/// Handed to the task driving a freshly registered exchange.
#[derive(Debug)]
pub struct Ticket {
    /// Identity of the registered entry.
    pub id: ExchangeId,
    /// Fires when the entry is purged by someone other than its owner.
    pub abort: oneshot::Receiver<AbortReason>,
}

/// Result of asking for an inbound exchange on a key.
pub enum InboundRegistration {
    /// An inbound exchange already existed; join its pending result.
    Joined(PendingReceive),
    /// A new inbound exchange was registered.
    Registered(Ticket),
}

struct OutboundEntry {
    id: ExchangeId,
    peer: ContextId,
    started_at: DateTime<Utc>,
    abort: oneshot::Sender<AbortReason>,
}

struct InboundEntry {
    id: ExchangeId,
    received: bool,
    pending: PendingReceive,
    started_at: DateTime<Utc>,
    abort: oneshot::Sender<AbortReason>,
}

#[derive(Default)]
struct Slot {
    outbound: Option<OutboundEntry>,
    inbound: Option<InboundEntry>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.outbound.is_none() && self.inbound.is_none()
    }
}

/// Thread-safe registry of all active exchanges of one messenger.
#[derive(Clone)]
pub struct ExchangeRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    next_id: Arc<AtomicU64>,
}

impl ExchangeRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(&self) -> ExchangeId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether an outbound exchange is active for `key`.
    pub fn has_outbound(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|slot| slot.outbound.is_some())
    }

    /// Whether an inbound exchange is active for `key`.
    pub fn has_inbound(&self, key: &str) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|slot| slot.inbound.is_some())
    }

    /// Whether anything is registered for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Register an outbound exchange, enforcing single-flight.
    pub fn register_outbound(&self, key: &str, peer: ContextId) -> ExchangeResult<Ticket> {
        let mut slots = self.lock();
        let slot = slots.entry(key.to_string()).or_default();
        if slot.outbound.is_some() {
            return Err(ExchangeError::KeyInUse {
                key: key.to_string(),
            });
        }
        let (tx, rx) = oneshot::channel();
        let id = self.allocate_id();
        slot.outbound = Some(OutboundEntry {
            id,
            peer,
            started_at: Utc::now(),
            abort: tx,
        });
        check_invariants(&slots);
        Ok(Ticket { id, abort: rx })
    }

    /// Join the inbound exchange for `key`, or register one whose pending
    /// result is produced by `make_pending`.
    pub fn join_or_register_inbound<F>(&self, key: &str, make_pending: F) -> InboundRegistration
    where
        F: FnOnce() -> PendingReceive,
    {
        let mut slots = self.lock();
        let slot = slots.entry(key.to_string()).or_default();
        if let Some(existing) = &slot.inbound {
            return InboundRegistration::Joined(existing.pending.clone());
        }
        let (tx, rx) = oneshot::channel();
        let id = self.allocate_id();
        slot.inbound = Some(InboundEntry {
            id,
            received: false,
            pending: make_pending(),
            started_at: Utc::now(),
            abort: tx,
        });
        check_invariants(&slots);
        InboundRegistration::Registered(Ticket { id, abort: rx })
    }

    /// Latch the inbound exchange `id` on `key` and purge the key.
    ///
    /// Returns `true` exactly once per inbound exchange: for the first caller
    /// that finds the entry registered and not yet received. Setting the
    /// latch and removing both sides happen under the same lock.
    ///
    /// An outbound exchange this context runs on the same key is aborted
    /// with `PairedCleanup` rather than left retrying unregistered.
    pub fn latch_inbound(&self, key: &str, id: ExchangeId) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        match slot.inbound.as_mut() {
            Some(entry) if entry.id == id && !entry.received => entry.received = true,
            _ => return false,
        }
        if let Some(slot) = slots.remove(key) {
            release_peer_side(key, slot.outbound.map(|e| e.abort), Side::Outbound);
        }
        check_invariants(&slots);
        true
    }

    /// Finish the outbound exchange `id` on `key`, purging the key.
    ///
    /// A no-op if the entry is gone already (it was purged, and the key may
    /// since have been reused by a newer exchange).
    pub fn finish_outbound(&self, key: &str, id: ExchangeId) -> bool {
        let mut slots = self.lock();
        let owns_slot = slots
            .get(key)
            .and_then(|slot| slot.outbound.as_ref())
            .is_some_and(|entry| entry.id == id);
        if !owns_slot {
            return false;
        }
        if let Some(slot) = slots.remove(key) {
            release_peer_side(key, slot.inbound.map(|e| e.abort), Side::Inbound);
        }
        check_invariants(&slots);
        true
    }

    /// Drop the inbound exchange `id` on `key` without touching the
    /// outbound side.
    pub fn remove_inbound(&self, key: &str, id: ExchangeId) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(key) else {
            return false;
        };
        if !slot.inbound.as_ref().is_some_and(|entry| entry.id == id) {
            return false;
        }
        slot.inbound = None;
        if slot.is_empty() {
            slots.remove(key);
        }
        check_invariants(&slots);
        true
    }

    /// Remove both sides of `key`, signalling their owners with `reason`.
    pub fn purge(&self, key: &str, reason: AbortReason) -> bool {
        let mut slots = self.lock();
        let Some(slot) = slots.remove(key) else {
            return false;
        };
        if let Some(entry) = slot.outbound {
            let _ = entry.abort.send(reason);
        }
        if let Some(entry) = slot.inbound {
            let _ = entry.abort.send(reason);
        }
        debug!(key, %reason, "Purged exchange key");
        check_invariants(&slots);
        true
    }

    /// Snapshot of every registered exchange.
    pub fn snapshot(&self) -> Vec<ExchangeSummary> {
        let slots = self.lock();
        let mut out = Vec::new();
        for (key, slot) in slots.iter() {
            if let Some(entry) = &slot.outbound {
                out.push(ExchangeSummary {
                    key: key.clone(),
                    side: Side::Outbound,
                    id: entry.id,
                    peer: Some(entry.peer),
                    started_at: entry.started_at,
                });
            }
            if let Some(entry) = &slot.inbound {
                out.push(ExchangeSummary {
                    key: key.clone(),
                    side: Side::Inbound,
                    id: entry.id,
                    peer: None,
                    started_at: entry.started_at,
                });
            }
        }
        out
    }

    /// Number of active outbound exchanges.
    pub fn outbound_count(&self) -> usize {
        self.lock().values().filter(|s| s.outbound.is_some()).count()
    }

    /// Number of active inbound exchanges.
    pub fn inbound_count(&self) -> usize {
        self.lock().values().filter(|s| s.inbound.is_some()).count()
    }

    /// Number of keys with at least one active exchange.
    pub fn key_count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for ExchangeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal the opposite side of a finished key that it has been purged.
fn release_peer_side(key: &str, abort: Option<oneshot::Sender<AbortReason>>, side: Side) {
    if let Some(abort) = abort {
        debug!(key, ?side, "Paired cleanup purged the opposite side");
        let _ = abort.send(AbortReason::PairedCleanup);
    }
}

/// Empty slots are never retained and a latched inbound entry never
/// outlives the critical section that latched it.
fn check_invariants(slots: &HashMap<String, Slot>) {
    debug_assert!(
        slots.values().all(|slot| !slot.is_empty()),
        "registry retained an empty slot"
    );
    debug_assert!(
        slots
            .values()
            .all(|slot| slot.inbound.as_ref().map_or(true, |e| !e.received)),
        "registry retained a latched inbound exchange"
    );
}
