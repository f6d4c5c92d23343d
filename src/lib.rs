//! Two-party payment channels: an agreed, monotonically versioned balance
//! state advanced off-chain through a signed update protocol, guarded by a
//! ledger watcher, and settleable on an authoritative ledger even against a
//! non-cooperative counterparty.
//!
//! The ledger itself, the counterparty connection and the channel
//! opening/funding handshake are collaborators behind the [ledger] and
//! [wire] boundaries; this crate owns the state transitions, the agreement
//! protocol and the dispute logic.

pub mod channel;
mod client;
pub mod ledger;
pub mod messages;
pub mod sig;
mod types;
pub mod watcher;
pub mod wire;

pub use client::{ChannelClient, OpenError};
pub use types::{Address, ChannelId, Hash, Signature, U256};
