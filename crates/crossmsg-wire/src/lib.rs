//! Exactly-once-effectively message exchange between execution contexts.
//!
//! Two contexts (windows, tabs, frames) that can only talk through a lossy,
//! unordered, fire-and-forget channel exchange one logical message per key:
//! the sender retransmits until acknowledged, the receiver latches the first
//! acceptable copy and acknowledges it once.
//!
//! ## Architecture
//!
//! - **Messenger**: Public operations for one hosting context
//! - **ExchangeRegistry**: Single-flight bookkeeping and paired cleanup per key
//! - **Envelope**: JSON-tagged Data / Ack messages
//! - **PeerResolver**: Locates the peer by handle, name or structure
//! - **Environment / PeerContext**: Traits over the raw channel, with an
//!   in-memory implementation in [`memory`]

pub mod config;
pub mod memory;
pub mod message;
pub mod messenger;
pub mod options;
pub mod origin;
pub mod peer;
pub mod receiver;
pub mod registry;
pub mod resolver;
pub mod sender;

pub use crossmsg_types::{AbortReason, ExchangeError, ExchangeResult, MessengerConfig};
pub use memory::{MemoryBrowser, MemoryContext};
pub use message::Envelope;
pub use messenger::Messenger;
pub use options::{OpenOptions, ReceiveOptions, SendOptions};
pub use peer::{ContextId, Environment, PeerContext, PeerHandle};
pub use receiver::PendingReceive;
pub use registry::ExchangeRegistry;
pub use resolver::{PeerResolver, PeerTarget, ProbeResolver};
pub use sender::{PendingSend, SendReceipt};
