//! Channel parameters and the versioned balance state, together with the
//! pure transitions that derive successor states.

use super::{PartIdx, PARTICIPANTS};
use crate::types::{Address, ChannelId, Hash, Signature, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use thiserror::Error;

/// Static, agreed-upon configuration of a channel instance.
///
/// Immutable for the channel's lifetime; the channel id is derived from it.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Params {
    /// Seconds the participants have to refute an on-chain registration of a
    /// non-final state.
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: [Address; PARTICIPANTS],
}

impl Params {
    pub fn new(
        participants: [Address; PARTICIPANTS],
        challenge_duration: u64,
        nonce: U256,
    ) -> Self {
        Params {
            challenge_duration,
            nonce,
            participants,
        }
    }

    /// Derives the channel id as the digest of the packed parameters.
    pub fn channel_id(&self) -> ChannelId {
        let mut hasher = Keccak256::new();
        hasher.update(self.challenge_duration.to_be_bytes());
        let mut buf = [0u8; 32];
        self.nonce.to_big_endian(&mut buf);
        hasher.update(buf);
        for part in &self.participants {
            hasher.update(part.0);
        }
        Hash(hasher.finalize().into())
    }
}

/// Funds held in the channel, one slot per participant index.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Balances(pub [U256; PARTICIPANTS]);

impl Balances {
    /// Sum over both slots; `None` on overflow.
    pub fn total(&self) -> Option<U256> {
        self.0[0].checked_add(self.0[1])
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("transfer amount must be positive")]
    InvalidAmount,
    #[error("insufficient funds: balance is {available}, tried to send {requested}")]
    InsufficientFunds { available: U256, requested: U256 },
    #[error("receiving balance would overflow")]
    BalanceOverflow,
    #[error("channel {id:?} is already final at version {version}")]
    ChannelAlreadyFinal { id: ChannelId, version: u64 },
}

/// Snapshot of the channel at one version.
///
/// `id` and `version` are private so that the transitions below are the only
/// way to obtain a successor state; writing garbage to those fields would
/// otherwise only be caught by runtime checks in the update protocol.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct State {
    id: ChannelId,
    version: u64,
    pub balances: Balances,
    pub is_final: bool,
}

impl State {
    /// The version-0 state of a channel described by `params`.
    pub fn new(params: &Params, init_bals: Balances) -> Self {
        State {
            id: params.channel_id(),
            version: 0,
            balances: init_bals,
            is_final: false,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn make_next(&self) -> Self {
        State {
            id: self.id,
            version: self.version + 1,
            balances: self.balances,
            is_final: self.is_final,
        }
    }

    fn already_final(&self) -> TransitionError {
        TransitionError::ChannelAlreadyFinal {
            id: self.id,
            version: self.version,
        }
    }

    /// Derives the successor state in which `sender` has paid `amount` to
    /// the other participant.
    pub fn transfer(&self, sender: PartIdx, amount: U256) -> Result<State, TransitionError> {
        debug_assert!(sender < PARTICIPANTS);
        if self.is_final {
            return Err(self.already_final());
        }
        if amount.is_zero() {
            return Err(TransitionError::InvalidAmount);
        }

        let receiver = 1 - sender;
        let mut next = self.make_next();
        next.balances.0[sender] = self.balances.0[sender].checked_sub(amount).ok_or(
            TransitionError::InsufficientFunds {
                available: self.balances.0[sender],
                requested: amount,
            },
        )?;
        next.balances.0[receiver] = self.balances.0[receiver]
            .checked_add(amount)
            .ok_or(TransitionError::BalanceOverflow)?;
        Ok(next)
    }

    /// Derives the terminal successor state: same balances, `is_final` set.
    ///
    /// A final state can be settled on the ledger without waiting out the
    /// challenge duration and cannot be progressed any further.
    pub fn finalize(&self) -> Result<State, TransitionError> {
        if self.is_final {
            return Err(self.already_final());
        }
        let mut next = self.make_next();
        next.is_final = true;
        Ok(next)
    }

    /// Canonical digest of the state, the message that gets signed.
    pub fn digest(&self) -> Hash {
        let mut hasher = Keccak256::new();
        hasher.update(self.id.0);
        hasher.update(self.version.to_be_bytes());
        for bal in self.balances.0 {
            let mut buf = [0u8; 32];
            bal.to_big_endian(&mut buf);
            hasher.update(buf);
        }
        hasher.update([self.is_final as u8]);
        Hash(hasher.finalize().into())
    }
}

/// A state together with both participants' signatures over its digest.
///
/// This is the unit kept as the channel's current state and shipped to the
/// ledger as dispute evidence.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub state: State,
    pub sigs: [Signature; PARTICIPANTS],
}
