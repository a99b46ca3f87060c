//! Receiver protocol: drives one inbound exchange.
//!
//! The receive task listens for Data envelopes on its key. The first one
//! that passes the acceptance policy latches the exchange in the registry,
//! settles the pending result with its payload and (when asked) answers with
//! a single Ack. Every later duplicate finds the key purged and is ignored.

use crate::message::{DataEnvelope, Envelope};
use crate::origin::is_allowed_origin;
use crate::peer::{ContextId, Environment, InboundEvent, Subscription};
use crate::registry::{ExchangeRegistry, Ticket};
use crossmsg_types::{AbortReason, ExchangeError, ExchangeResult, WILDCARD_ORIGIN};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Pending result of an inbound exchange.
///
/// Cloneable: every clone settles with the same outcome, which is how a
/// second `await_once` on a busy key joins the first one.
#[derive(Clone)]
pub struct PendingReceive {
    key: String,
    inner: Shared<BoxFuture<'static, ExchangeResult<Value>>>,
}

impl PendingReceive {
    /// The key this result belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The outcome, if the exchange has already settled.
    pub fn peek(&self) -> Option<ExchangeResult<Value>> {
        self.inner.peek().cloned()
    }
}

impl Future for PendingReceive {
    type Output = ExchangeResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl fmt::Debug for PendingReceive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReceive")
            .field("key", &self.key)
            .field("settled", &self.inner.peek().is_some())
            .finish()
    }
}

/// Create the settle half and the shared pending half of an inbound result.
///
/// If the settle half is dropped unused the pending half resolves to
/// `Aborted { reason: ChannelClosed }`.
pub(crate) fn pending_pair(
    key: &str,
) -> (oneshot::Sender<ExchangeResult<Value>>, PendingReceive) {
    let (tx, rx) = oneshot::channel();
    let owned = key.to_string();
    let inner = async move {
        rx.await.unwrap_or_else(|_| {
            Err(ExchangeError::Aborted {
                key: owned,
                reason: AbortReason::ChannelClosed,
            })
        })
    }
    .boxed()
    .shared();
    (
        tx,
        PendingReceive {
            key: key.to_string(),
            inner,
        },
    )
}

/// Which Data envelopes an inbound exchange accepts.
#[derive(Debug, Clone)]
pub struct AcceptPolicy {
    /// Origins accepted; `"*"` accepts any.
    pub allowed_origins: Vec<String>,
    /// When set, only envelopes posted by this context are accepted.
    pub expected_peer: Option<ContextId>,
}

impl AcceptPolicy {
    /// Return the Data envelope carried by `event` if it belongs to `key`
    /// and passes the policy.
    pub fn accept(&self, key: &str, event: &InboundEvent) -> Option<DataEnvelope> {
        let Envelope::Data(data) = Envelope::decode(&event.data)? else {
            return None;
        };
        if data.key != key {
            return None;
        }
        if let Some(expected) = self.expected_peer {
            if event.source_id() != Some(expected) {
                debug!(key, "Ignoring Data from an unexpected source");
                return None;
            }
        }
        if !is_allowed_origin(&event.origin, &self.allowed_origins) {
            debug!(key, origin = %event.origin, "Ignoring Data from a disallowed origin");
            return None;
        }
        Some(data)
    }
}

/// Everything the receive task owns.
pub(crate) struct ReceiveTask {
    pub key: String,
    pub ticket: Ticket,
    pub policy: AcceptPolicy,
    pub subscription: Subscription,
    pub registry: ExchangeRegistry,
    pub settle: oneshot::Sender<ExchangeResult<Value>>,
}

/// Spawn the task driving one inbound exchange.
pub(crate) fn spawn_receiver(task: ReceiveTask) {
    tokio::spawn(task.run());
}

impl ReceiveTask {
    async fn run(self) {
        let ReceiveTask {
            key,
            ticket,
            policy,
            mut subscription,
            registry,
            settle,
        } = self;
        let Ticket { id, mut abort } = ticket;

        let outcome = loop {
            tokio::select! {
                biased;
                reason = &mut abort => {
                    let reason = reason.unwrap_or(AbortReason::Cancelled);
                    debug!(key = %key, %reason, "Inbound exchange aborted");
                    break Err(ExchangeError::Aborted { key: key.clone(), reason });
                }
                event = subscription.recv() => {
                    let Some(event) = event else {
                        registry.remove_inbound(&key, id);
                        warn!(key = %key, "Inbound channel closed before any Data arrived");
                        break Err(ExchangeError::Aborted {
                            key: key.clone(),
                            reason: AbortReason::ChannelClosed,
                        });
                    };
                    let Some(data) = policy.accept(&key, &event) else {
                        continue;
                    };
                    if !registry.latch_inbound(&key, id) {
                        // Purged concurrently; the abort signal is already queued.
                        continue;
                    }
                    if data.expect_ack {
                        send_ack(&key, &data, &event);
                    }
                    info!(key = %key, id = %data.id, "Inbound exchange latched");
                    break Ok(data.payload);
                }
            }
        };

        drop(subscription);
        let _ = settle.send(outcome);
    }
}

/// Answer an accepted Data envelope, addressed to the observed source and
/// origin.
fn send_ack(key: &str, data: &DataEnvelope, event: &InboundEvent) {
    let Some(source) = &event.source else {
        debug!(key, "Accepted Data has no source, cannot acknowledge");
        return;
    };
    let target_origin = if event.origin.is_empty() {
        WILDCARD_ORIGIN
    } else {
        event.origin.as_str()
    };
    let ack = Envelope::ack_for(data);
    debug!(key, id = %data.id, target_origin, "Sending Ack");
    if let Err(e) = source.post_message(ack.to_value(), target_origin) {
        debug!(key, error = %e, "Ack transmission failed");
    }
}

/// Name the hosting context so senders can find it by `name`.
///
/// An existing different name is kept unless `force` is set. Returns whether
/// the context now carries `name`.
pub fn announce(env: &dyn Environment, name: &str, force: bool) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    let current = env.name();
    if current == name {
        return true;
    }
    if !current.is_empty() && !force {
        warn!(
            current = %current,
            requested = name,
            "Context already has a name, not overwriting it"
        );
        return false;
    }
    env.set_name(name);
    debug!(name, "Announced context name");
    true
}
