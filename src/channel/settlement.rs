//! Registering states with the ledger and withdrawing the settled balance.

use super::active::PaymentChannel;
use super::state::{SignedState, TransitionError};
use super::update::ProposeError;
use crate::ledger::{LedgerAdapter, LedgerError};
use crate::wire::Transport;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SettleError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("settlement cancelled")]
    Cancelled,
    #[error("cancelled after the registration was broadcast; conclusion is in flight")]
    InFlight,
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("finalizing: {0}")]
    Finalize(#[from] ProposeError),
    #[error("settling: {0}")]
    Settle(#[from] SettleError),
}

impl<T: Transport, L: LedgerAdapter> PaymentChannel<T, L> {
    /// Settles the channel: makes sure the current state is registered on
    /// the ledger, waits out the challenge duration unless that state is
    /// final, and withdraws the balance to the configured receiver.
    ///
    /// Blocks until the withdrawal went through. Settling an already
    /// settled channel is a no-op; a second withdrawal is never issued.
    /// Call [finalize](Self::finalize) first to skip the challenge wait.
    pub async fn settle(&self, cancel: &CancellationToken) -> Result<(), SettleError> {
        let snapshot = {
            let core = self.inner.core.lock().await;
            if core.settled {
                debug!(channel = ?self.inner.id, "already settled, nothing to do");
                return Ok(());
            }
            core.current
        };
        self.conclude(&snapshot, cancel).await
    }

    /// Cooperatively finalizes the channel, then settles it.
    ///
    /// If the counterparty does not cooperate (rejects, times out, or the
    /// transport fails) the channel is settled with the current non-final
    /// state instead, paying the challenge-duration wait. Only
    /// cancellation aborts the close.
    pub async fn finalize_and_settle(&self, cancel: &CancellationToken) -> Result<(), CloseError> {
        match self.finalize(cancel).await {
            Ok(_) => {}
            // a current state that is already final settles just as fast
            Err(ProposeError::InvalidTransition(TransitionError::ChannelAlreadyFinal {
                ..
            })) => {}
            Err(e @ ProposeError::Cancelled) => return Err(CloseError::Finalize(e)),
            Err(e) => {
                warn!(
                    channel = ?self.inner.id,
                    error = %e,
                    "cooperative finalize failed, falling back to forced settlement",
                );
            }
        }
        Ok(self.settle(cancel).await?)
    }

    /// Registers `snapshot`, waits out the dispute window for non-final
    /// states, and withdraws. Shared between [settle](Self::settle) and the
    /// watch task.
    pub(crate) async fn conclude(
        &self,
        snapshot: &SignedState,
        cancel: &CancellationToken,
    ) -> Result<(), SettleError> {
        let receipt = tokio::select! {
            _ = cancel.cancelled() => return Err(SettleError::Cancelled),
            res = self.inner.ledger.register_state(&self.inner.params, snapshot) => res?,
        };
        info!(
            channel = ?self.inner.id,
            version = snapshot.state.version(),
            tx = ?receipt.tx_hash,
            "state registered",
        );

        if !snapshot.state.is_final {
            let window = Duration::from_secs(self.inner.params.challenge_duration);
            debug!(channel = ?self.inner.id, ?window, "waiting out the challenge duration");
            tokio::select! {
                _ = cancel.cancelled() => return Err(SettleError::InFlight),
                _ = time::sleep(window) => {}
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(SettleError::InFlight),
            res = self.withdraw_once() => res,
        }
    }

    /// Withdraws the channel balance to the configured receiver, at most
    /// once per channel.
    pub(crate) async fn withdraw_once(&self) -> Result<(), SettleError> {
        {
            let mut core = self.inner.core.lock().await;
            if core.settled {
                debug!(channel = ?self.inner.id, "already settled, skipping withdrawal");
                return Ok(());
            }
            // Taken before the ledger call so a concurrent settle/watch
            // task cannot withdraw a second time; rolled back on failure.
            core.settled = true;
        }
        match self
            .inner
            .ledger
            .withdraw(self.inner.id, self.inner.withdraw_receiver)
            .await
        {
            Ok(receipt) => {
                info!(
                    channel = ?self.inner.id,
                    receiver = ?self.inner.withdraw_receiver,
                    tx = ?receipt.tx_hash,
                    "funds withdrawn",
                );
                Ok(())
            }
            Err(e) => {
                self.inner.core.lock().await.settled = false;
                Err(e.into())
            }
        }
    }
}
