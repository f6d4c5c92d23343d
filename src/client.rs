use crate::channel::{ChannelConfig, Params, PartIdx, PaymentChannel, SignedState};
use crate::ledger::LedgerAdapter;
use crate::sig::{self, Signer};
use crate::types::Address;
use crate::wire::Transport;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("local signer is not one of the channel participants")]
    NotAParticipant,
    #[error("initial state does not belong to the channel described by the parameters")]
    ChannelIdMismatch,
    #[error("initial signature {part_idx} was made by {addr:?}, not the registered participant")]
    InvalidSignature { part_idx: PartIdx, addr: Address },
    #[error("recovering initial state signer: {0}")]
    Recovery(#[from] sig::Error),
}

/// Binds this participant's signer and ledger connection and hands out
/// channel sessions. Usually an application has exactly one.
#[derive(Debug)]
pub struct ChannelClient<L> {
    signer: Signer,
    ledger: L,
    cfg: ChannelConfig,
}

impl<L: LedgerAdapter + Clone> ChannelClient<L> {
    pub fn new(signer: Signer, ledger: L) -> Self {
        Self::with_config(signer, ledger, ChannelConfig::default())
    }

    pub fn with_config(signer: Signer, ledger: L, cfg: ChannelConfig) -> Self {
        ChannelClient {
            signer,
            ledger,
            cfg,
        }
    }

    /// The address this client signs with.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Opens the session for a channel whose parameters and fully signed
    /// current state both participants already agreed on (the opening and
    /// funding handshake happens outside this crate).
    ///
    /// Checks that this client is one of the participants, that the state
    /// belongs to the channel derived from the parameters, and that both
    /// signatures were made by the registered participants.
    pub fn open_channel<T: Transport>(
        &self,
        transport: T,
        params: Params,
        initial: SignedState,
        withdraw_receiver: Address,
    ) -> Result<PaymentChannel<T, L>, OpenError> {
        let our_addr = self.signer.address();
        let part_idx = params
            .participants
            .iter()
            .position(|a| *a == our_addr)
            .ok_or(OpenError::NotAParticipant)?;

        if initial.state.channel_id() != params.channel_id() {
            return Err(OpenError::ChannelIdMismatch);
        }

        let digest = initial.state.digest();
        for (idx, sig) in initial.sigs.iter().enumerate() {
            let recovered = self.signer.recover_signer(digest, *sig)?;
            if recovered != params.participants[idx] {
                return Err(OpenError::InvalidSignature {
                    part_idx: idx,
                    addr: recovered,
                });
            }
        }

        info!(
            channel = ?params.channel_id(),
            part_idx,
            version = initial.state.version(),
            "channel session opened",
        );
        Ok(PaymentChannel::new(
            params,
            part_idx,
            withdraw_receiver,
            self.cfg,
            self.signer.clone(),
            transport,
            self.ledger.clone(),
            initial,
        ))
    }
}
