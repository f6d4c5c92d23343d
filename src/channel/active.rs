//! The live channel session and the proposing half of the update protocol.

use super::state::{Balances, Params, SignedState, State, TransitionError};
use super::update::{self, HandleError, IncomingUpdate, ProposeError};
use super::{PartIdx, PARTICIPANTS};
use crate::ledger::LedgerAdapter;
use crate::messages::{Message, UpdateProposal};
use crate::sig::Signer;
use crate::types::{Address, ChannelId, Signature, U256};
use crate::wire::{Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables for one channel session.
#[derive(Debug, Copy, Clone)]
pub struct ChannelConfig {
    /// How long a proposer waits for the counterparty's answer before the
    /// update counts as timed out.
    pub proposal_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            proposal_timeout: Duration::from_secs(30),
        }
    }
}

/// The mutable part of a session: the single mutual-exclusion boundary
/// shared by proposer, responder, watcher and settlement. Every
/// read-modify-replace of the current state happens under this lock, so
/// the watcher always disputes with the true latest version.
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) current: SignedState,
    /// Version of the update currently awaiting the counterparty's answer,
    /// if any. At most one proposal may be outstanding per channel.
    pub(crate) pending: Option<u64>,
    pub(crate) settled: bool,
}

#[derive(Debug)]
pub(crate) struct Inner<T, L> {
    pub(crate) id: ChannelId,
    pub(crate) params: Params,
    pub(crate) part_idx: PartIdx,
    pub(crate) withdraw_receiver: Address,
    pub(crate) cfg: ChannelConfig,
    pub(crate) signer: Signer,
    pub(crate) transport: T,
    pub(crate) ledger: L,
    pub(crate) core: Mutex<Core>,
}

/// A live two-party payment channel session.
///
/// Binds the agreed parameters to the current signed state, the local
/// participant index and the signing/transport/ledger collaborators.
/// Clones are cheap and share the session, which is how the watch task and
/// the update protocol observe the same current state.
#[derive(Debug)]
pub struct PaymentChannel<T, L> {
    pub(crate) inner: Arc<Inner<T, L>>,
}

impl<T, L> Clone for PaymentChannel<T, L> {
    fn clone(&self) -> Self {
        PaymentChannel {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport, L: LedgerAdapter> PaymentChannel<T, L> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        params: Params,
        part_idx: PartIdx,
        withdraw_receiver: Address,
        cfg: ChannelConfig,
        signer: Signer,
        transport: T,
        ledger: L,
        initial: SignedState,
    ) -> Self {
        debug_assert!(part_idx < PARTICIPANTS);
        PaymentChannel {
            inner: Arc::new(Inner {
                id: initial.state.channel_id(),
                params,
                part_idx,
                withdraw_receiver,
                cfg,
                signer,
                transport,
                ledger,
                core: Mutex::new(Core {
                    current: initial,
                    pending: None,
                    settled: false,
                }),
            }),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn params(&self) -> Params {
        self.inner.params
    }

    /// Our index in the channel.
    pub fn idx(&self) -> PartIdx {
        self.inner.part_idx
    }

    /// The current agreed state.
    pub async fn state(&self) -> State {
        self.inner.core.lock().await.current.state
    }

    pub async fn version(&self) -> u64 {
        self.state().await.version()
    }

    pub async fn balances(&self) -> Balances {
        self.state().await.balances
    }

    /// Pays `amount` to the counterparty.
    ///
    /// Derives the successor state, proposes it and waits for the
    /// counterparty's acceptance. On rejection, timeout or cancellation the
    /// current state is unchanged; retrying is the caller's decision and
    /// starts from the then-current state.
    pub async fn send(
        &self,
        amount: U256,
        cancel: &CancellationToken,
    ) -> Result<State, ProposeError> {
        let idx = self.inner.part_idx;
        self.propose_update(cancel, |cur| cur.transfer(idx, amount))
            .await
    }

    /// Proposes to finalize the channel with the current balances, making
    /// it settleable without waiting out the challenge duration.
    pub async fn finalize(&self, cancel: &CancellationToken) -> Result<State, ProposeError> {
        self.propose_update(cancel, |cur| cur.finalize()).await
    }

    async fn propose_update<F>(
        &self,
        cancel: &CancellationToken,
        derive: F,
    ) -> Result<State, ProposeError>
    where
        F: FnOnce(&State) -> Result<State, TransitionError>,
    {
        // Deriving under the lock pins the candidate to the state it
        // succeeds; an update accepted in between would otherwise race the
        // version check on the other side.
        let proposal = {
            let mut core = self.inner.core.lock().await;
            if core.settled {
                return Err(ProposeError::ChannelSettled);
            }
            if core.pending.is_some() {
                return Err(ProposeError::UpdateInProgress);
            }
            let candidate = derive(&core.current.state)?;
            let sig = self.inner.signer.sign(candidate.digest());
            core.pending = Some(candidate.version());
            UpdateProposal {
                state: candidate,
                actor_idx: self.inner.part_idx,
                sig,
            }
        };

        debug!(
            channel = ?self.inner.id,
            version = proposal.state.version(),
            "proposing update",
        );
        let res = self.exchange(proposal, cancel).await;

        let mut core = self.inner.core.lock().await;
        core.pending = None;
        let their_sig = res?;

        let mut sigs = [Signature::default(); PARTICIPANTS];
        sigs[self.inner.part_idx] = proposal.sig;
        sigs[1 - self.inner.part_idx] = their_sig;
        core.current = SignedState {
            state: proposal.state,
            sigs,
        };
        info!(
            channel = ?self.inner.id,
            version = proposal.state.version(),
            "update applied",
        );
        Ok(proposal.state)
    }

    /// Sends the proposal and drives the transport until the counterparty
    /// answers for exactly this version, under the configured timeout.
    /// Counterparty proposals arriving while ours is outstanding get
    /// rejected.
    async fn exchange(
        &self,
        proposal: UpdateProposal,
        cancel: &CancellationToken,
    ) -> Result<Signature, ProposeError> {
        self.inner
            .transport
            .send(Message::UpdateProposal(proposal))
            .await?;

        let version = proposal.state.version();
        let digest = proposal.state.digest();
        let other = 1 - self.inner.part_idx;

        let wait = async {
            loop {
                match self.inner.transport.recv().await? {
                    Message::UpdateAccepted(acc) => {
                        if acc.channel != self.inner.id || acc.version != version {
                            debug!(
                                channel = ?self.inner.id,
                                version = acc.version,
                                "ignoring stray acceptance",
                            );
                            continue;
                        }
                        let signer = self.inner.signer.recover_signer(digest, acc.sig)?;
                        if self.inner.params.participants[other] != signer {
                            return Err(ProposeError::InvalidSignature(signer));
                        }
                        return Ok(acc.sig);
                    }
                    Message::UpdateRejected {
                        version: v, reason, ..
                    } if v == version => {
                        return Err(ProposeError::Rejected { version, reason });
                    }
                    Message::UpdateRejected { version: v, .. } => {
                        debug!(
                            channel = ?self.inner.id,
                            version = v,
                            "ignoring stray rejection",
                        );
                    }
                    Message::UpdateProposal(theirs) => {
                        warn!(
                            channel = ?self.inner.id,
                            theirs = theirs.state.version(),
                            "rejecting counterparty proposal while ours is outstanding",
                        );
                        // Best effort; if the transport is down the timeout
                        // ends this exchange anyway.
                        let _ = self
                            .send_rejection(theirs.state.version(), "update already in progress")
                            .await;
                    }
                }
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProposeError::Cancelled),
            res = time::timeout(self.inner.cfg.proposal_timeout, wait) => match res {
                Ok(r) => r,
                Err(_) => Err(ProposeError::Timeout),
            },
        }
    }

    /// Waits for the counterparty's next update proposal and returns it as
    /// a decision guard.
    ///
    /// Invalid proposals are answered with a reasoned rejection and
    /// surfaced as errors; calling again resumes waiting.
    ///
    /// The transport is a single ordered stream, so a session must have at
    /// most one message consumer at a time: either an in-flight
    /// [send](Self::send)/[finalize](Self::finalize) exchange or this
    /// method, not both. The watch task is unaffected, it never touches
    /// the transport.
    pub async fn next_update(&self) -> Result<IncomingUpdate<'_, T, L>, HandleError> {
        loop {
            match self.inner.transport.recv().await? {
                Message::UpdateProposal(prop) => {
                    let verdict = {
                        let core = self.inner.core.lock().await;
                        update::verify_proposal(
                            &self.inner.params,
                            &core.current.state,
                            &prop,
                            &self.inner.signer,
                            self.inner.part_idx,
                        )
                    };
                    if let Err(e) = verdict {
                        warn!(
                            channel = ?self.inner.id,
                            version = prop.state.version(),
                            error = %e,
                            "rejecting invalid update proposal",
                        );
                        self.send_rejection(prop.state.version(), &e.to_string())
                            .await?;
                        return Err(e);
                    }
                    return Ok(IncomingUpdate::new(self, prop));
                }
                Message::UpdateAccepted(acc) => {
                    debug!(
                        channel = ?self.inner.id,
                        version = acc.version,
                        "ignoring acceptance without outstanding proposal",
                    );
                }
                Message::UpdateRejected { version, .. } => {
                    debug!(
                        channel = ?self.inner.id,
                        version,
                        "ignoring rejection without outstanding proposal",
                    );
                }
            }
        }
    }

    pub(super) async fn send_rejection(
        &self,
        version: u64,
        reason: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .transport
            .send(Message::UpdateRejected {
                channel: self.inner.id,
                version,
                reason: reason.to_string(),
            })
            .await
    }
}
