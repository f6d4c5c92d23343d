//! Validation of proposed state transitions and the responder half of the
//! update protocol.

use super::active::PaymentChannel;
use super::state::{Params, SignedState, State, TransitionError};
use super::{PartIdx, PARTICIPANTS};
use crate::ledger::LedgerAdapter;
use crate::messages::{Message, UpdateAccepted, UpdateProposal};
use crate::sig::{self, Signer};
use crate::types::{Address, Signature};
use crate::wire::{Transport, TransportError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidUpdate {
    #[error("channel id mismatch")]
    ChannelIdMismatch,
    #[error("version {got} does not follow current version {current}")]
    NonSequentialVersion { current: u64, got: u64 },
    #[error("current state is final")]
    CurrentStateIsFinal,
    #[error("update does not conserve the total balance")]
    TotalBalanceMismatch,
}

/// Errors observed by the proposing side of an update.
#[derive(Debug, Error)]
pub enum ProposeError {
    #[error("channel is already settled")]
    ChannelSettled,
    #[error("another update proposal is already outstanding")]
    UpdateInProgress,
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("counterparty rejected version {version}: {reason}")]
    Rejected { version: u64, reason: String },
    #[error("timed out waiting for the counterparty's answer")]
    Timeout,
    #[error("proposal cancelled")]
    Cancelled,
    #[error("acceptance signed by {0:?}, which is not the counterparty")]
    InvalidSignature(Address),
    #[error("recovering acceptance signer: {0}")]
    Recovery(#[from] sig::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors observed by the responding side of an update.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error(transparent)]
    InvalidUpdate(#[from] InvalidUpdate),
    #[error("proposal actor index {0} is not the counterparty")]
    InvalidActor(PartIdx),
    #[error("proposal signed by {0:?}, which does not match the proposing participant")]
    InvalidSignature(Address),
    #[error("recovering proposal signer: {0}")]
    Recovery(#[from] sig::Error),
    #[error("a local update proposal is outstanding")]
    UpdateInProgress,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Checks that `candidate` is a valid direct successor of `current`:
/// same channel, current not final, version advanced by exactly one, and
/// the total balance conserved.
pub(super) fn validate_transition(
    current: &State,
    candidate: &State,
) -> Result<(), InvalidUpdate> {
    if candidate.channel_id() != current.channel_id() {
        Err(InvalidUpdate::ChannelIdMismatch)
    } else if current.is_final {
        Err(InvalidUpdate::CurrentStateIsFinal)
    } else if candidate.version() != current.version() + 1 {
        Err(InvalidUpdate::NonSequentialVersion {
            current: current.version(),
            got: candidate.version(),
        })
    } else if candidate.balances.total() != current.balances.total() {
        Err(InvalidUpdate::TotalBalanceMismatch)
    } else {
        Ok(())
    }
}

/// Full validation of an incoming proposal: transition rules, the actor
/// must be the counterparty, and the signature must recover to its address.
pub(super) fn verify_proposal(
    params: &Params,
    current: &State,
    prop: &UpdateProposal,
    signer: &Signer,
    local_idx: PartIdx,
) -> Result<(), HandleError> {
    if prop.actor_idx >= PARTICIPANTS || prop.actor_idx == local_idx {
        return Err(HandleError::InvalidActor(prop.actor_idx));
    }
    validate_transition(current, &prop.state)?;
    let recovered = signer.recover_signer(prop.state.digest(), prop.sig)?;
    if params.participants[prop.actor_idx] != recovered {
        return Err(HandleError::InvalidSignature(recovered));
    }
    Ok(())
}

/// A validated update proposal from the counterparty, awaiting our decision.
///
/// Dropping the guard without deciding leaves the proposer to run into its
/// timeout; prefer [reject](Self::reject) to give it a reason.
#[derive(Debug)]
pub struct IncomingUpdate<'ch, T, L> {
    channel: &'ch PaymentChannel<T, L>,
    proposal: UpdateProposal,
}

impl<'ch, T: Transport, L: LedgerAdapter> IncomingUpdate<'ch, T, L> {
    pub(super) fn new(channel: &'ch PaymentChannel<T, L>, proposal: UpdateProposal) -> Self {
        IncomingUpdate { channel, proposal }
    }

    /// The proposed successor state.
    pub fn state(&self) -> &State {
        &self.proposal.state
    }

    /// Signs and commits the proposed state, then notifies the proposer.
    ///
    /// Acceptance is all-or-nothing: the commit is rolled back if the
    /// acceptance cannot be sent, so either both sides adopt the candidate
    /// or the previous state stays current on both.
    pub async fn accept(self) -> Result<State, HandleError> {
        let inner = &self.channel.inner;
        let candidate = self.proposal.state;
        let sig = inner.signer.sign(candidate.digest());

        let mut core = inner.core.lock().await;
        if core.pending.is_some() {
            drop(core);
            let _ = self
                .channel
                .send_rejection(candidate.version(), "update already in progress")
                .await;
            return Err(HandleError::UpdateInProgress);
        }
        // The current state may have moved since the proposal was validated.
        if let Err(e) = validate_transition(&core.current.state, &candidate) {
            drop(core);
            let _ = self
                .channel
                .send_rejection(candidate.version(), &e.to_string())
                .await;
            return Err(e.into());
        }

        let mut sigs = [Signature::default(); PARTICIPANTS];
        sigs[self.proposal.actor_idx] = self.proposal.sig;
        sigs[inner.part_idx] = sig;
        let previous = core.current;
        core.current = SignedState { state: candidate, sigs };

        let acc = Message::UpdateAccepted(UpdateAccepted {
            channel: inner.id,
            version: candidate.version(),
            sig,
        });
        // The lock is held across the send: commit and notification act as
        // one step and are rolled back together if the transport fails.
        if let Err(e) = inner.transport.send(acc).await {
            core.current = previous;
            return Err(e.into());
        }
        info!(channel = ?inner.id, version = candidate.version(), "update applied");
        Ok(candidate)
    }

    /// Declines the proposal; the current state stays unchanged on both
    /// sides.
    pub async fn reject(self, reason: &str) -> Result<(), HandleError> {
        debug!(
            channel = ?self.channel.inner.id,
            version = self.proposal.state.version(),
            reason,
            "rejecting update",
        );
        self.channel
            .send_rejection(self.proposal.state.version(), reason)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Balances;
    use crate::types::U256;

    fn params() -> Params {
        Params::new([Address([0xaa; 20]), Address([0xbb; 20])], 10, U256::one())
    }

    fn state() -> State {
        State::new(&params(), Balances([100.into(), 50.into()]))
    }

    #[test]
    fn accepts_direct_successor() {
        let cur = state();
        let next = cur.transfer(0, 30.into()).unwrap();
        assert_eq!(validate_transition(&cur, &next), Ok(()));
    }

    #[test]
    fn rejects_foreign_channel() {
        let cur = state();
        let mut other = params();
        other.nonce = U256::from(2);
        let foreign = State::new(&other, cur.balances)
            .transfer(0, 30.into())
            .unwrap();
        assert_eq!(
            validate_transition(&cur, &foreign),
            Err(InvalidUpdate::ChannelIdMismatch)
        );
    }

    #[test]
    fn rejects_version_skip() {
        let cur = state();
        let skipped = cur
            .transfer(0, 10.into())
            .unwrap()
            .transfer(0, 10.into())
            .unwrap();
        assert_eq!(
            validate_transition(&cur, &skipped),
            Err(InvalidUpdate::NonSequentialVersion { current: 0, got: 2 })
        );
    }

    #[test]
    fn rejects_successor_of_final_state() {
        let cur = state().finalize().unwrap();
        // hand-build a would-be successor from a non-final twin
        let next = state().transfer(0, 5.into()).unwrap();
        assert_eq!(
            validate_transition(&cur, &next),
            Err(InvalidUpdate::CurrentStateIsFinal)
        );
    }

    #[test]
    fn rejects_minted_funds() {
        let cur = state();
        let inflated = State::new(&params(), Balances([100.into(), 51.into()]))
            .transfer(0, 1.into())
            .unwrap();
        assert_eq!(
            validate_transition(&cur, &inflated),
            Err(InvalidUpdate::TotalBalanceMismatch)
        );
    }
}
