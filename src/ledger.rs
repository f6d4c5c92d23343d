//! Boundary to the authoritative ledger's adjudication logic.
//!
//! The core never talks to a chain directly; it produces signed states and
//! asks a [LedgerAdapter] to register them, to withdraw concluded funds and
//! to deliver adjudication events. The adapter's internals (consensus,
//! transaction building, confirmation tracking) are the collaborator's
//! concern.

use crate::channel::{Params, SignedState};
use crate::types::{Address, ChannelId, Hash};
use async_trait::async_trait;
use core::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger transaction failed: {0}")]
    TxFailed(String),
    #[error("timed out waiting for transaction confirmation")]
    ConfirmationTimeout,
    #[error("event subscription failed: {0}")]
    Subscribe(String),
}

/// Receipt for a ledger transaction that has been included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: Hash,
}

/// Adjudication event concerning one channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    /// A state was registered on-chain, opening (or refreshing) the dispute
    /// window. `version` and `is_final` describe the best registered state.
    Registered {
        channel: ChannelId,
        version: u64,
        is_final: bool,
    },
    /// The channel was concluded; balances can be withdrawn.
    Concluded { channel: ChannelId },
}

pub type EventStream = mpsc::Receiver<LedgerEvent>;

/// Capability to interact with the ledger's adjudicator for one or more
/// channels.
#[async_trait]
pub trait LedgerAdapter: Send + Sync + Debug {
    /// Registers `state`, signed by both participants, for adjudication.
    ///
    /// Registering a state whose version is not higher than the best already
    /// registered one is a no-op for the dispute outcome and must not fail.
    async fn register_state(
        &self,
        params: &Params,
        state: &SignedState,
    ) -> Result<TxReceipt, LedgerError>;

    /// Withdraws the concluded balance of `channel` to `receiver`.
    async fn withdraw(&self, channel: ChannelId, receiver: Address)
        -> Result<TxReceipt, LedgerError>;

    /// Subscribes to adjudication events for `channel`.
    async fn subscribe_events(&self, channel: ChannelId) -> Result<EventStream, LedgerError>;
}

// One adjudicator connection is commonly shared between every channel of a
// client, so the adapter is usually handed around as an Arc.
#[async_trait]
impl<L: LedgerAdapter + ?Sized> LedgerAdapter for Arc<L> {
    async fn register_state(
        &self,
        params: &Params,
        state: &SignedState,
    ) -> Result<TxReceipt, LedgerError> {
        (**self).register_state(params, state).await
    }

    async fn withdraw(
        &self,
        channel: ChannelId,
        receiver: Address,
    ) -> Result<TxReceipt, LedgerError> {
        (**self).withdraw(channel, receiver).await
    }

    async fn subscribe_events(&self, channel: ChannelId) -> Result<EventStream, LedgerError> {
        (**self).subscribe_events(channel).await
    }
}
