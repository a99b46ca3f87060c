//! Core types for crossmsg.
//!
//! This crate defines the error taxonomy shared by every exchange operation
//! and the configuration structure that supplies per-call defaults.

pub mod config;
pub mod error;

pub use config::MessengerConfig;
pub use error::{AbortReason, ExchangeError, ExchangeResult};

/// The wildcard origin. As a target origin it means "deliver regardless of
/// the peer's origin"; inside an allow-list it accepts any observed origin.
pub const WILDCARD_ORIGIN: &str = "*";
