//! Ledger watcher: guards the channel against stale on-chain registrations.

use crate::channel::{PaymentChannel, SettleError};
use crate::ledger::{LedgerAdapter, LedgerError, LedgerEvent};
use crate::wire::Transport;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("adjudication event subscription ended unexpectedly")]
    SubscriptionClosed,
    #[error(transparent)]
    Settle(#[from] SettleError),
}

impl<T: Transport, L: LedgerAdapter> PaymentChannel<T, L> {
    /// Watches the ledger for adjudication events concerning this channel.
    ///
    /// When a state gets registered on-chain with a lower version than the
    /// locally held latest, the latest state is registered in response
    /// before the challenge window closes. Once the window has passed
    /// without a newer counter-registration, the funds are withdrawn to the
    /// configured receiver.
    ///
    /// Runs until the channel is concluded, the token is cancelled, or an
    /// error occurs. Errors end the watch; nothing is retried internally,
    /// and it is the caller's job to restart the watch once the cause of
    /// the failure is fixed. Continuing silently after a failed dispute
    /// response could cost the channel's funds, so every failure is
    /// surfaced.
    pub async fn watch(&self, cancel: &CancellationToken) -> Result<(), WatchError> {
        let mut events = self.inner.ledger.subscribe_events(self.inner.id).await?;
        info!(channel = ?self.inner.id, "watcher started");

        // Armed once a registration was seen; firing means the dispute
        // window passed and the channel can be concluded.
        let mut conclude_at: Option<Instant> = None;

        loop {
            let (deadline, armed) = match conclude_at {
                Some(at) => (at, true),
                None => (Instant::now(), false),
            };

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                _ = time::sleep_until(deadline), if armed => {
                    self.withdraw_once().await?;
                    info!(channel = ?self.inner.id, "channel concluded by watcher");
                    return Ok(());
                }

                event = events.recv() => match event {
                    None => return Err(WatchError::SubscriptionClosed),
                    Some(LedgerEvent::Concluded { .. }) => {
                        self.withdraw_once().await?;
                        info!(channel = ?self.inner.id, "channel concluded");
                        return Ok(());
                    }
                    Some(LedgerEvent::Registered { version, is_final, .. }) => {
                        let snapshot = self.inner.core.lock().await.current;
                        let effective_final = if version < snapshot.state.version() {
                            warn!(
                                channel = ?self.inner.id,
                                registered = version,
                                latest = snapshot.state.version(),
                                "stale state registered on-chain, refuting with the latest state",
                            );
                            let receipt = self
                                .inner
                                .ledger
                                .register_state(&self.inner.params, &snapshot)
                                .await?;
                            debug!(channel = ?self.inner.id, tx = ?receipt.tx_hash, "refutation registered");
                            snapshot.state.is_final
                        } else {
                            is_final
                        };

                        let window = if effective_final {
                            Duration::ZERO
                        } else {
                            Duration::from_secs(self.inner.params.challenge_duration)
                        };
                        conclude_at = Some(Instant::now() + window);
                    }
                },
            }
        }
    }
}
