//! Shared test doubles: an in-memory transport pair and a mock ledger
//! adjudicator.

// not every test binary uses every helper
#![allow(dead_code)]

use async_trait::async_trait;
use paychan::channel::{
    Balances, ChannelConfig, Params, PaymentChannel, SignedState, State,
};
use paychan::ledger::{EventStream, LedgerAdapter, LedgerError, LedgerEvent, TxReceipt};
use paychan::messages::Message;
use paychan::sig::Signer;
use paychan::wire::{Transport, TransportError};
use paychan::{Address, ChannelClient, ChannelId, Hash};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// One side of an unbounded in-memory duplex message pipe.
#[derive(Debug)]
pub struct PipeTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

pub fn pipe() -> (PipeTransport, PipeTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        PipeTransport {
            tx: tx_a,
            rx: Mutex::new(rx_b),
        },
        PipeTransport {
            tx: tx_b,
            rx: Mutex::new(rx_a),
        },
    )
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send(&self, msg: Message) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Message, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    best: HashMap<ChannelId, SignedState>,
    withdrawals: Vec<(ChannelId, Address)>,
    subscribers: HashMap<ChannelId, Vec<mpsc::Sender<LedgerEvent>>>,
}

/// Mock adjudicator: keeps the best registered state per channel, fans
/// registration events out to subscribers and records withdrawals.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: StdMutex<LedgerState>,
    tx_counter: AtomicU64,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn receipt(&self) -> TxReceipt {
        let n = self.tx_counter.fetch_add(1, Ordering::Relaxed);
        let mut hash = Hash([0; 32]);
        hash.0[..8].copy_from_slice(&n.to_be_bytes());
        TxReceipt { tx_hash: hash }
    }

    fn emit(&self, channel: ChannelId, event: LedgerEvent) {
        let subs = self
            .state
            .lock()
            .unwrap()
            .subscribers
            .get(&channel)
            .cloned()
            .unwrap_or_default();
        for tx in subs {
            let _ = tx.try_send(event);
        }
    }

    pub fn best_registered(&self, channel: ChannelId) -> Option<SignedState> {
        self.state.lock().unwrap().best.get(&channel).copied()
    }

    pub fn registered_version(&self, channel: ChannelId) -> Option<u64> {
        self.best_registered(channel).map(|s| s.state.version())
    }

    pub fn withdrawals(&self, channel: ChannelId) -> Vec<Address> {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, r)| *r)
            .collect()
    }

    /// Emits a conclusion event, as if the channel was concluded on-chain.
    pub fn conclude(&self, channel: ChannelId) {
        self.emit(channel, LedgerEvent::Concluded { channel });
    }

    /// Closes all event subscriptions for `channel`.
    pub fn drop_subscribers(&self, channel: ChannelId) {
        self.state.lock().unwrap().subscribers.remove(&channel);
    }
}

#[async_trait]
impl LedgerAdapter for MockLedger {
    async fn register_state(
        &self,
        _params: &Params,
        state: &SignedState,
    ) -> Result<TxReceipt, LedgerError> {
        let channel = state.state.channel_id();
        let event = {
            let mut st = self.state.lock().unwrap();
            let better = match st.best.get(&channel) {
                Some(cur) => state.state.version() > cur.state.version(),
                None => true,
            };
            if better {
                st.best.insert(channel, *state);
            }
            let best = st.best[&channel];
            LedgerEvent::Registered {
                channel,
                version: best.state.version(),
                is_final: best.state.is_final,
            }
        };
        // every registration attempt refreshes the dispute
        self.emit(channel, event);
        Ok(self.receipt())
    }

    async fn withdraw(
        &self,
        channel: ChannelId,
        receiver: Address,
    ) -> Result<TxReceipt, LedgerError> {
        self.state
            .lock()
            .unwrap()
            .withdrawals
            .push((channel, receiver));
        Ok(self.receipt())
    }

    async fn subscribe_events(&self, channel: ChannelId) -> Result<EventStream, LedgerError> {
        let (tx, rx) = mpsc::channel(16);
        self.state
            .lock()
            .unwrap()
            .subscribers
            .entry(channel)
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

pub struct Net<T, U> {
    pub alice: PaymentChannel<T, Arc<MockLedger>>,
    pub bob: PaymentChannel<U, Arc<MockLedger>>,
    pub ledger: Arc<MockLedger>,
    pub params: Params,
    pub initial: SignedState,
}

pub type TestNet = Net<PipeTransport, PipeTransport>;

pub fn test_signer(seed: u64) -> Signer {
    Signer::new(&mut StdRng::seed_from_u64(seed))
}

fn agreed_opening(balances: (u64, u64), challenge: u64) -> (Signer, Signer, Params, SignedState) {
    let mut rng = StdRng::seed_from_u64(7);
    let alice = Signer::new(&mut rng);
    let bob = Signer::new(&mut rng);
    let params = Params::new([alice.address(), bob.address()], challenge, rng.gen());
    let state = State::new(&params, Balances([balances.0.into(), balances.1.into()]));
    let digest = state.digest();
    let initial = SignedState {
        state,
        sigs: [alice.sign(digest), bob.sign(digest)],
    };
    (alice, bob, params, initial)
}

/// Opens both sessions of one channel over the given transports, each party
/// withdrawing to its own address.
pub fn open_over<T: Transport, U: Transport>(
    ta: T,
    tb: U,
    balances: (u64, u64),
    challenge: u64,
    cfg: ChannelConfig,
) -> Net<T, U> {
    let (alice_signer, bob_signer, params, initial) = agreed_opening(balances, challenge);
    let (alice_addr, bob_addr) = (alice_signer.address(), bob_signer.address());
    let ledger = MockLedger::new();

    let alice = ChannelClient::with_config(alice_signer, ledger.clone(), cfg)
        .open_channel(ta, params, initial, alice_addr)
        .unwrap();
    let bob = ChannelClient::with_config(bob_signer, ledger.clone(), cfg)
        .open_channel(tb, params, initial, bob_addr)
        .unwrap();

    Net {
        alice,
        bob,
        ledger,
        params,
        initial,
    }
}

pub fn open_pair_with(balances: (u64, u64), challenge: u64, cfg: ChannelConfig) -> TestNet {
    let (ta, tb) = pipe();
    open_over(ta, tb, balances, challenge, cfg)
}

pub fn open_pair(balances: (u64, u64)) -> TestNet {
    open_pair_with(balances, 60, ChannelConfig::default())
}

/// Alice's session plus the counterparty's raw pipe end, for tests that
/// play the counterparty by hand.
pub struct SoloNet {
    pub alice: PaymentChannel<PipeTransport, Arc<MockLedger>>,
    pub bob_end: PipeTransport,
    pub bob_signer: Signer,
    pub ledger: Arc<MockLedger>,
    pub params: Params,
    pub initial: SignedState,
}

pub fn open_solo(balances: (u64, u64)) -> SoloNet {
    open_solo_with(balances, 60, ChannelConfig::default())
}

pub fn open_solo_with(balances: (u64, u64), challenge: u64, cfg: ChannelConfig) -> SoloNet {
    let (alice_signer, bob_signer, params, initial) = agreed_opening(balances, challenge);
    let alice_addr = alice_signer.address();
    let ledger = MockLedger::new();
    let (ta, tb) = pipe();

    let alice = ChannelClient::with_config(alice_signer, ledger.clone(), cfg)
        .open_channel(ta, params, initial, alice_addr)
        .unwrap();

    SoloNet {
        alice,
        bob_end: tb,
        bob_signer,
        ledger,
        params,
        initial,
    }
}

/// Spawns a task accepting every valid incoming update on `channel`.
pub fn auto_accept<T: Transport + 'static>(
    channel: &PaymentChannel<T, Arc<MockLedger>>,
) -> JoinHandle<()> {
    let ch = channel.clone();
    tokio::spawn(async move {
        loop {
            match ch.next_update().await {
                Ok(update) => {
                    let _ = update.accept().await;
                }
                Err(_) => break,
            }
        }
    })
}
