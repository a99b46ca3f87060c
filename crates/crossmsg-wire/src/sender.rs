//! Sender protocol: drives one outbound exchange.
//!
//! The first Data envelope goes out before the task is spawned. After that
//! the task retransmits on every interval tick until one of:
//!
//! - a matching Ack arrives (resolved with a [`SendReceipt`])
//! - the absolute deadline passes (`Timeout`)
//! - a tick finds the peer context closed (`PeerUnreachable`)
//! - the registry purges the entry (`Aborted`)
//!
//! On its own terminal states the task finishes the registry entry, which
//! also purges any inbound exchange on the same key.

use crate::message::Envelope;
use crate::origin::is_wildcard;
use crate::peer::{InboundEvent, Liveness, PeerHandle, Subscription};
use crate::registry::{ExchangeRegistry, Ticket};
use crossmsg_types::{AbortReason, ExchangeError, ExchangeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Successful outcome of an outbound exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// The acknowledged key.
    pub key: String,
}

/// Pending outcome of an outbound exchange.
#[derive(Debug)]
pub struct PendingSend {
    key: String,
    rx: oneshot::Receiver<ExchangeResult<SendReceipt>>,
}

impl PendingSend {
    /// The key this exchange was started for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Future for PendingSend {
    type Output = ExchangeResult<SendReceipt>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ExchangeError::Aborted {
                key: self.key.clone(),
                reason: AbortReason::ChannelClosed,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The immutable description of one outbound exchange.
pub(crate) struct OutboundExchange {
    pub key: String,
    pub payload: Value,
    pub peer: PeerHandle,
    pub target_origin: String,
    pub interval: Duration,
    pub deadline: Duration,
}

/// Everything the send task owns.
pub(crate) struct SendTask {
    pub exchange: OutboundExchange,
    pub ticket: Ticket,
    pub subscription: Subscription,
    pub registry: ExchangeRegistry,
}

/// Transmit the first Data envelope and spawn the task that drives the rest
/// of the exchange.
pub(crate) fn start(task: SendTask) -> PendingSend {
    let started = Instant::now();
    task.exchange.transmit(1);
    let (tx, rx) = oneshot::channel();
    let key = task.exchange.key.clone();
    tokio::spawn(async move {
        let outcome = task.run(started).await;
        let _ = tx.send(outcome);
    });
    PendingSend { key, rx }
}

impl SendTask {
    async fn run(self, started: Instant) -> ExchangeResult<SendReceipt> {
        let SendTask {
            exchange,
            ticket,
            mut subscription,
            registry,
        } = self;
        let Ticket { id, mut abort } = ticket;
        let key = exchange.key.as_str();
        let deadline_ms = exchange.deadline.as_millis() as u64;

        let mut ticker = interval_at(started + exchange.interval, exchange.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep_until(started + exchange.deadline);
        tokio::pin!(deadline);

        let mut listening = true;
        let mut attempt: u32 = 1;

        let outcome = loop {
            tokio::select! {
                biased;
                reason = &mut abort => {
                    let reason = reason.unwrap_or(AbortReason::Cancelled);
                    debug!(key, %reason, "Outbound exchange aborted");
                    return Err(ExchangeError::Aborted { key: key.to_string(), reason });
                }
                event = subscription.recv(), if listening => {
                    match event {
                        Some(event) if exchange.is_matching_ack(&event) => {
                            info!(key, attempt, "Exchange acknowledged");
                            break Ok(SendReceipt { key: key.to_string() });
                        }
                        Some(_) => {}
                        None => {
                            debug!(key, "Inbound channel closed, retrying until the deadline");
                            listening = false;
                        }
                    }
                }
                () = &mut deadline => {
                    warn!(key, attempt, deadline_ms, "No acknowledgement before the deadline");
                    break Err(ExchangeError::Timeout { key: key.to_string(), deadline_ms });
                }
                _ = ticker.tick() => {
                    if exchange.peer.liveness() == Liveness::Closed {
                        warn!(key, attempt, "Peer context closed, giving up");
                        break Err(ExchangeError::PeerUnreachable { key: key.to_string() });
                    }
                    attempt += 1;
                    exchange.transmit(attempt);
                }
            }
        };

        drop(subscription);
        registry.finish_outbound(key, id);
        outcome
    }
}

impl OutboundExchange {
    /// An Ack for our key, from our peer, and (unless the target origin is
    /// the wildcard) from the origin we addressed.
    fn is_matching_ack(&self, event: &InboundEvent) -> bool {
        let Some(Envelope::Ack(ack)) = Envelope::decode(&event.data) else {
            return false;
        };
        if ack.key != self.key {
            return false;
        }
        if event.source_id() != Some(self.peer.context_id()) {
            debug!(key = %self.key, "Ignoring Ack from another context");
            return false;
        }
        if !is_wildcard(&self.target_origin) && event.origin != self.target_origin {
            debug!(key = %self.key, origin = %event.origin, "Ignoring Ack from an unexpected origin");
            return false;
        }
        true
    }

    /// Post one Data envelope with a fresh id. Failures are swallowed.
    fn transmit(&self, attempt: u32) {
        let envelope = Envelope::data(&self.key, self.payload.clone());
        debug!(key = %self.key, attempt, id = envelope.id(), "Transmitting Data");
        if let Err(e) = self
            .peer
            .post_message(envelope.to_value(), &self.target_origin)
        {
            debug!(key = %self.key, attempt, error = %e, "Transmission failed");
        }
    }
}
