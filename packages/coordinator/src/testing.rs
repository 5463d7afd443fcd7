//! In-process chain and actuator doubles
//!
//! Used by the unit tests and the integration suite under `tests/`. Both mocks
//! are cheap to clone and share their state, so a test can hand one copy to
//! the code under test and keep another to script and inspect it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::{address, Address, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};

use crate::events::{ChainEvent, DepositObserved, ObservedEvent, SourceEvent, WithdrawalObserved};
use crate::hash::{compute_transfer_hash, keccak256};
use crate::tokens::TokenMapping;
use crate::types::{BlockRef, Chain, Direction, Transfer, TransferState};
use crate::watchers::ChainReader;
use crate::writers::{Action, Actuator, ActuatorError, Receipt, TxHandle};

pub const TEST_USER: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");
/// Chain A token (the `l1Token` of the deployment records)
pub const TOKEN_A: Address = address!("e7f1725E7734CE288F8367e1Bb143E90bb3F0512");
/// Chain B token mapped to [`TOKEN_A`]
pub const TOKEN_B: Address = address!("Cf7Ed3AccA5a467e9e704C703E8D87F634fB0Fc9");
pub const UNMAPPED_TOKEN: Address = address!("000000000000000000000000000000000000dEaD");

/// 1 token with 18 decimals
pub fn one_token() -> U256 {
    U256::from(10u64).pow(U256::from(18u64))
}

/// Mapping with the single `TOKEN_A <-> TOKEN_B` pair
pub fn test_mapping() -> TokenMapping {
    let mut mapping = TokenMapping::new();
    mapping
        .insert(TOKEN_A, TOKEN_B)
        .unwrap_or_else(|e| panic!("test mapping: {}", e));
    mapping
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Deterministic block hash for the mock chains
pub fn mock_block_hash(chain: Chain, number: u64, generation: u64) -> B256 {
    let mut data = Vec::with_capacity(17);
    data.push(chain.as_str().as_bytes()[0]);
    data.extend_from_slice(&number.to_be_bytes());
    data.extend_from_slice(&generation.to_be_bytes());
    B256::from(keccak256(&data))
}

pub fn deposit_event(nonce: u64) -> DepositObserved {
    deposit_event_for(TOKEN_A, one_token(), nonce)
}

/// Deposit whose emitted hash matches the canonical derivation
pub fn deposit_event_for(token: Address, amount: U256, nonce: u64) -> DepositObserved {
    let nonce = U256::from(nonce);
    DepositObserved {
        user: TEST_USER,
        token,
        amount,
        nonce,
        deposit_hash: compute_transfer_hash(Direction::DepositAtoB, &TEST_USER, &token, &amount, &nonce),
    }
}

pub fn withdrawal_event(nonce: u64) -> WithdrawalObserved {
    let nonce = U256::from(nonce);
    let amount = one_token();
    WithdrawalObserved {
        user: TEST_USER,
        l2_token: TOKEN_B,
        l1_token: TOKEN_A,
        amount,
        nonce,
        withdrawal_hash: compute_transfer_hash(
            Direction::WithdrawalBtoA,
            &TEST_USER,
            &TOKEN_B,
            &amount,
            &nonce,
        ),
    }
}

/// Wrap a chain event as a confirmed observation at `block`
pub fn observed_at(chain: Chain, block: u64, event: ChainEvent) -> SourceEvent {
    SourceEvent::Observed(ObservedEvent {
        chain,
        block: BlockRef::new(block, mock_block_hash(chain, block, 0)),
        log_index: 0,
        event,
    })
}

pub fn deposit_at(block: u64, nonce: u64) -> SourceEvent {
    observed_at(Chain::A, block, ChainEvent::Deposit(deposit_event(nonce)))
}

pub fn withdrawal_at(block: u64, nonce: u64) -> SourceEvent {
    observed_at(
        Chain::B,
        block,
        ChainEvent::WithdrawalInitiated(withdrawal_event(nonce)),
    )
}

/// The 1e18, nonce 7 deposit from chain A
pub fn sample_deposit() -> Transfer {
    let event = deposit_event(7);
    let now = Utc::now();
    Transfer {
        transfer_hash: event.deposit_hash,
        direction: Direction::DepositAtoB,
        user: event.user,
        origin_token: event.token,
        destination_token: None,
        claimed_destination_token: None,
        amount: event.amount,
        origin_nonce: event.nonce,
        origin_hash: event.deposit_hash,
        state: TransferState::Observed,
        origin_confirmed_at: 100,
        origin_block_hash: mock_block_hash(Chain::A, 100, 0),
        destination_tx: None,
        destination_applied_at: None,
        challenge_deadline: None,
        failure: None,
        review: None,
        attempts: 0,
        created_at: now,
        updated_at: now,
    }
}

/// A 1e18 withdrawal from chain B, nonce 1, no deadline yet
pub fn sample_withdrawal() -> Transfer {
    let event = withdrawal_event(1);
    let now = Utc::now();
    Transfer {
        transfer_hash: event.withdrawal_hash,
        direction: Direction::WithdrawalBtoA,
        user: event.user,
        origin_token: event.l2_token,
        destination_token: None,
        claimed_destination_token: Some(event.l1_token),
        amount: event.amount,
        origin_nonce: event.nonce,
        origin_hash: event.withdrawal_hash,
        state: TransferState::Observed,
        origin_confirmed_at: 50,
        origin_block_hash: mock_block_hash(Chain::B, 50, 0),
        destination_tx: None,
        destination_applied_at: None,
        challenge_deadline: None,
        failure: None,
        review: None,
        attempts: 0,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Default)]
struct ChainState {
    head: u64,
    /// Starting blocks of every simulated reorg
    reorgs: Vec<u64>,
    logs: Vec<(u64, ChainEvent)>,
}

impl ChainState {
    fn generation(&self, number: u64) -> u64 {
        self.reorgs.iter().filter(|from| **from <= number).count() as u64
    }
}

/// Scriptable chain: blocks, bridge logs, reorgs and transport failures
#[derive(Debug, Clone)]
pub struct MockChainReader {
    chain: Chain,
    state: Arc<Mutex<ChainState>>,
    failures: Arc<AtomicU32>,
    reconnects: Arc<AtomicU32>,
}

impl MockChainReader {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            state: Arc::new(Mutex::new(ChainState::default())),
            failures: Arc::new(AtomicU32::new(0)),
            reconnects: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Raise the head to `number`; never lowers it
    pub fn mine_to(&self, number: u64) {
        let mut state = lock(&self.state);
        state.head = state.head.max(number);
    }

    pub fn add_event(&self, block: u64, event: ChainEvent) {
        lock(&self.state).logs.push((block, event));
    }

    pub fn add_deposit(&self, block: u64, nonce: u64) {
        self.add_event(block, ChainEvent::Deposit(deposit_event(nonce)));
    }

    pub fn add_withdrawal(&self, block: u64, nonce: u64) {
        self.add_event(block, ChainEvent::WithdrawalInitiated(withdrawal_event(nonce)));
    }

    /// Replace every block from `number` upward with a new fork
    pub fn reorg_from(&self, number: u64) {
        lock(&self.state).reorgs.push(number);
    }

    pub fn remove_deposits_from(&self, number: u64) {
        lock(&self.state).logs.retain(|(block, _)| *block < number);
    }

    /// Canonical hash of block `number`, `None` above the head
    pub fn hash_of(&self, number: u64) -> Option<B256> {
        let state = lock(&self.state);
        (number <= state.head).then(|| mock_block_hash(self.chain, number, state.generation(number)))
    }

    /// Fail the next `count` RPC calls
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(eyre!("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn head(&self) -> Result<u64> {
        self.check_failure()?;
        Ok(lock(&self.state).head)
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>> {
        self.check_failure()?;
        Ok(self.hash_of(number))
    }

    async fn events(&self, from: u64, to: u64) -> Result<Vec<ObservedEvent>> {
        self.check_failure()?;
        let state = lock(&self.state);
        let mut per_block: HashMap<u64, u64> = HashMap::new();
        let mut out = Vec::new();
        for (block, event) in &state.logs {
            let index = per_block.entry(*block).or_insert(0);
            let log_index = *index;
            *index += 1;
            if *block < from || *block > to || *block > state.head {
                continue;
            }
            out.push(ObservedEvent {
                chain: self.chain,
                block: BlockRef::new(
                    *block,
                    mock_block_hash(self.chain, *block, state.generation(*block)),
                ),
                log_index,
                event: event.clone(),
            });
        }
        Ok(out)
    }

    async fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct ActuatorState {
    /// Scripted submit failures; the flag applies the call before failing
    submit_errors: VecDeque<(ActuatorError, bool)>,
    finality_errors: VecDeque<ActuatorError>,
    applied: HashMap<B256, Receipt>,
    apply_counts: HashMap<B256, usize>,
    calls: Vec<Action>,
    next_block: u64,
    submit_delay: Option<Duration>,
}

impl ActuatorState {
    fn apply(&mut self, action: &Action) -> Receipt {
        let hash = action.transfer_hash();
        let count = self.apply_counts.entry(hash).or_insert(0);
        *count += 1;

        let mut seed = hash.to_vec();
        seed.extend_from_slice(&(*count as u64).to_be_bytes());
        self.next_block += 1;
        let receipt = Receipt {
            tx_hash: B256::from(keccak256(&seed)),
            block_number: 1_000 + self.next_block,
        };
        self.applied.insert(hash, receipt);
        receipt
    }
}

/// Destination chain double that remembers which hashes it has applied and
/// rejects a second apply the way the bridge contracts do
#[derive(Debug, Clone)]
pub struct MockActuator {
    chain: Chain,
    state: Arc<Mutex<ActuatorState>>,
}

impl MockActuator {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            state: Arc::new(Mutex::new(ActuatorState::default())),
        }
    }

    pub fn push_submit_error(&self, error: ActuatorError) {
        lock(&self.state).submit_errors.push_back((error, false));
    }

    /// The next submit lands on chain but reports `error` to the caller
    pub fn push_submit_error_after_apply(&self, error: ActuatorError) {
        lock(&self.state).submit_errors.push_back((error, true));
    }

    pub fn push_finality_error(&self, error: ActuatorError) {
        lock(&self.state).finality_errors.push_back(error);
    }

    /// Record `hash` as applied by some earlier, unseen transaction
    pub fn set_already_applied(&self, action: &Action) {
        lock(&self.state).apply(action);
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        lock(&self.state).submit_delay = Some(delay);
    }

    /// Every action passed to `submit`, in order
    pub fn calls(&self) -> Vec<Action> {
        lock(&self.state).calls.clone()
    }

    pub fn submit_count(&self) -> usize {
        lock(&self.state).calls.len()
    }

    /// Times the destination actually applied `hash`
    pub fn applied_count(&self, hash: &B256) -> usize {
        lock(&self.state)
            .apply_counts
            .get(hash)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Actuator for MockActuator {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn submit(&self, action: &Action) -> Result<TxHandle, ActuatorError> {
        let delay = lock(&self.state).submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.calls.push(action.clone());

        if let Some((error, apply)) = state.submit_errors.pop_front() {
            if apply && !state.applied.contains_key(&action.transfer_hash()) {
                state.apply(action);
            }
            return Err(error);
        }

        if state.applied.contains_key(&action.transfer_hash()) {
            return Err(ActuatorError::AlreadyApplied);
        }

        let receipt = state.apply(action);
        Ok(TxHandle {
            chain: self.chain,
            tx_hash: receipt.tx_hash,
            block_number: None,
        })
    }

    async fn await_finality(&self, handle: &TxHandle) -> Result<Receipt, ActuatorError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.finality_errors.pop_front() {
            return Err(error);
        }
        state
            .applied
            .values()
            .find(|r| r.tx_hash == handle.tx_hash)
            .copied()
            .ok_or(ActuatorError::Dropped(handle.tx_hash))
    }

    async fn find_applied(&self, action: &Action) -> Result<Option<Receipt>, ActuatorError> {
        Ok(lock(&self.state)
            .applied
            .get(&action.transfer_hash())
            .copied())
    }
}
