//! Messenger: the public face of the exchange protocols.
//!
//! A [`Messenger`] belongs to one hosting context. It owns that context's
//! exchange registry, validates every call against the origin policy,
//! resolves the peer, and hands the exchange to the sender or receiver task.
//! Validation failures are returned synchronously, before anything is sent.

use crate::options::{OpenOptions, ReceiveOptions, SendOptions};
use crate::origin::{derive_origin, downgrade_reason, forbids_downgrade, is_wildcard};
use crate::peer::Environment;
use crate::receiver::{self, pending_pair, AcceptPolicy, PendingReceive, ReceiveTask};
use crate::registry::{ExchangeRegistry, InboundRegistration};
use crate::resolver::{resolve_chain, PeerResolver, ProbeResolver};
use crate::sender::{self, OutboundExchange, PendingSend, SendTask};
use crossmsg_types::{
    AbortReason, ExchangeError, ExchangeResult, MessengerConfig, WILDCARD_ORIGIN,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Guidance attached to `OpenFailed` when the environment refuses to create
/// a context.
const OPEN_REFUSED_GUIDANCE: &str = "the environment refused to create a new context. \
     A popup blocker may be active (allow popups for this site), the call may not \
     originate from a user gesture (open from a click handler), or the limit of open \
     contexts may have been reached (close unused ones)";

/// Reliable message exchange for one hosting context.
pub struct Messenger {
    env: Arc<dyn Environment>,
    resolver: Arc<dyn PeerResolver>,
    registry: ExchangeRegistry,
    config: MessengerConfig,
}

impl Messenger {
    /// Create a messenger with default configuration.
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self::with_config(env, MessengerConfig::default())
    }

    /// Create a messenger whose unset call options fall back to `config`.
    pub fn with_config(env: Arc<dyn Environment>, config: MessengerConfig) -> Self {
        let resolver = Arc::new(ProbeResolver::new(Arc::clone(&env)));
        Self {
            env,
            resolver,
            registry: ExchangeRegistry::new(),
            config,
        }
    }

    /// Replace the peer resolution strategy.
    pub fn with_resolver(mut self, resolver: Arc<dyn PeerResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Use an existing registry instead of a private one.
    pub fn with_registry(mut self, registry: ExchangeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// This context's exchange registry.
    pub fn registry(&self) -> &ExchangeRegistry {
        &self.registry
    }

    /// Defaults applied to unset call options.
    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    /// The hosting context.
    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    /// Send `payload` under `key` until the peer acknowledges it.
    pub fn initiate_with_retry(
        &self,
        key: &str,
        payload: Value,
        options: SendOptions,
    ) -> ExchangeResult<PendingSend> {
        if self.registry.has_outbound(key) {
            return Err(ExchangeError::KeyInUse {
                key: key.to_string(),
            });
        }

        let peer = resolve_chain(
            self.resolver.as_ref(),
            options.peer_handle.as_ref(),
            options.peer_name.as_deref(),
        )
        .ok_or_else(|| ExchangeError::UnresolvedTarget {
            key: key.to_string(),
        })?;

        let target_origin = options.resolved_target_origin(&self.config);
        self.check_downgrade(&target_origin)?;

        let ticket = self.registry.register_outbound(key, peer.context_id())?;
        let subscription = self.env.subscribe();
        let exchange = OutboundExchange {
            key: key.to_string(),
            payload,
            peer,
            target_origin,
            interval: options.interval(&self.config),
            deadline: options.deadline(&self.config),
        };
        info!(
            key,
            peer = %exchange.peer.context_id(),
            target_origin = %exchange.target_origin,
            interval_ms = exchange.interval.as_millis() as u64,
            deadline_ms = exchange.deadline.as_millis() as u64,
            "Starting outbound exchange"
        );

        Ok(sender::start(SendTask {
            exchange,
            ticket,
            subscription,
            registry: self.registry.clone(),
        }))
    }

    /// Wait for the first acceptable Data envelope on `key`.
    ///
    /// While an inbound exchange for `key` is pending, further calls return
    /// the same pending result and their options are ignored.
    pub fn await_once(&self, key: &str, options: ReceiveOptions) -> PendingReceive {
        let (settle, pending) = pending_pair(key);
        let ticket = match self
            .registry
            .join_or_register_inbound(key, || pending.clone())
        {
            InboundRegistration::Joined(existing) => {
                debug!(key, "Joining the pending inbound exchange");
                return existing;
            }
            InboundRegistration::Registered(ticket) => ticket,
        };

        if let Some(announce) = &options.announce_as {
            receiver::announce(self.env.as_ref(), &announce.name, announce.force);
        }

        let policy = AcceptPolicy {
            allowed_origins: options.resolved_allowed_origins(&self.config),
            expected_peer: options.expected_peer.as_ref().map(|p| p.context_id()),
        };
        debug!(key, allowed_origins = ?policy.allowed_origins, "Listening for inbound exchange");

        receiver::spawn_receiver(ReceiveTask {
            key: key.to_string(),
            ticket,
            policy,
            subscription: self.env.subscribe(),
            registry: self.registry.clone(),
            settle,
        });
        pending
    }

    /// Open a new peer context at `url` and start an exchange with it.
    pub fn open_peer_and_initiate(
        &self,
        url: &str,
        key: &str,
        payload: Value,
        options: OpenOptions,
    ) -> ExchangeResult<PendingSend> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ExchangeError::OpenFailed {
                reason: "no URL given".to_string(),
            });
        }

        let base = self.env.location();
        let target_origin = derive_origin(url, base.as_ref()).unwrap_or_else(|| {
            warn!(url, "Could not derive an origin, Ack origin checks are disabled");
            WILDCARD_ORIGIN.to_string()
        });
        self.check_downgrade(&target_origin)?;

        if self.registry.has_outbound(key) {
            return Err(ExchangeError::KeyInUse {
                key: key.to_string(),
            });
        }

        let peer = self
            .env
            .open_url(url, options.features.as_deref())
            .ok_or_else(|| ExchangeError::OpenFailed {
                reason: OPEN_REFUSED_GUIDANCE.to_string(),
            })?;
        debug!(url, peer = %peer.context_id(), "Opened peer context");

        let send = SendOptions {
            peer_handle: Some(peer),
            peer_name: None,
            target_origin: Some(target_origin),
            ..options.send
        };
        self.initiate_with_retry(key, payload, send)
    }

    /// Abort every exchange on `key`. Returns whether anything was pending.
    pub fn cancel(&self, key: &str) -> bool {
        let purged = self.registry.purge(key, AbortReason::Cancelled);
        if purged {
            info!(key, "Cancelled exchange");
        }
        purged
    }

    fn check_downgrade(&self, target_origin: &str) -> ExchangeResult<()> {
        if is_wildcard(target_origin) {
            return Ok(());
        }
        let Some(location) = self.env.location() else {
            return Ok(());
        };
        if forbids_downgrade(location.scheme(), target_origin) {
            warn!(
                scheme = location.scheme(),
                target_origin, "Refusing to message an insecure origin"
            );
            return Err(ExchangeError::SecurityPolicyViolation {
                reason: downgrade_reason(location.scheme(), target_origin),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("context", &self.env.context_id())
            .field("active_keys", &self.registry.key_count())
            .field("config", &self.config)
            .finish()
    }
}
