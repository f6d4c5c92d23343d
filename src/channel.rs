//! Channel sessions: the versioned balance state and its transitions, the
//! two-party update protocol, and dispute settlement.

mod active;
mod settlement;
pub mod state;
mod update;

pub use active::{ChannelConfig, PaymentChannel};
pub use settlement::{CloseError, SettleError};
pub use state::{Balances, Params, SignedState, State, TransitionError};
pub use update::{HandleError, IncomingUpdate, InvalidUpdate, ProposeError};

/// Index of a participant in the channel.
///
/// `0` is the participant that proposed the channel.
pub type PartIdx = usize;

/// This crate models exactly the two-party case.
pub const PARTICIPANTS: usize = 2;
