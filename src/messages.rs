//! Messages exchanged between the two participants of a channel.

use crate::channel::{PartIdx, State};
use crate::types::{ChannelId, Signature};
use serde::{Deserialize, Serialize};

/// A signed candidate state proposed as the channel's next current state.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct UpdateProposal {
    pub state: State,
    /// Index of the participant proposing the update.
    pub actor_idx: PartIdx,
    /// The actor's signature over the candidate state's digest.
    pub sig: Signature,
}

/// Acceptance of a previously received [UpdateProposal].
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq)]
pub struct UpdateAccepted {
    pub channel: ChannelId,
    pub version: u64,
    /// The accepting participant's signature over the candidate's digest.
    pub sig: Signature,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Message {
    UpdateProposal(UpdateProposal),
    UpdateAccepted(UpdateAccepted),
    UpdateRejected {
        channel: ChannelId,
        version: u64,
        reason: String,
    },
}
