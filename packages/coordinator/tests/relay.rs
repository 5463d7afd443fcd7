//! End-to-end relay scenarios against in-process chains
//!
//! Run with: cargo test --test relay
//!
//! The Postgres test is ignored by default and needs DATABASE_URL:
//!   DATABASE_URL=postgres://... cargo test --test relay -- --ignored

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};

use bridge_coordinator::challenge::{ChallengeTimer, ManualClock};
use bridge_coordinator::engine::{EngineHandle, EngineSettings, RelayEngine};
use bridge_coordinator::events::{ChainEvent, SourceEvent};
use bridge_coordinator::ledger::{LedgerStore, MemoryStore, TransferLedger};
use bridge_coordinator::testing::{
    deposit_at, deposit_event, deposit_event_for, observed_at, sample_deposit, sample_withdrawal,
    test_mapping, withdrawal_at, withdrawal_event, MockActuator, MockChainReader, TOKEN_A,
    TOKEN_B, UNMAPPED_TOKEN,
};
use bridge_coordinator::types::{
    BlockRef, Chain, FailureReason, ReviewFlag, Transfer, TransferState,
};
use bridge_coordinator::watchers::{EventSource, WatcherConfig};
use bridge_coordinator::writers::{Action, ActuatorError, Actuators, RetryConfig};
use bridge_coordinator::RelayError;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

mod helpers {
    use super::*;

    pub struct Bridge {
        pub engine: RelayEngine,
        pub chain_a: MockActuator,
        pub chain_b: MockActuator,
        pub clock: Arc<ManualClock>,
        pub store: Arc<MemoryStore>,
    }

    impl Bridge {
        pub async fn new() -> Self {
            Self::with_store(Arc::new(MemoryStore::new())).await
        }

        /// Start over an existing store, the way a restarted process would
        pub async fn with_store(store: Arc<MemoryStore>) -> Self {
            Self::restart(store, MockActuator::new(Chain::A), MockActuator::new(Chain::B)).await
        }

        pub async fn restart(
            store: Arc<MemoryStore>,
            chain_a: MockActuator,
            chain_b: MockActuator,
        ) -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            let ledger = TransferLedger::open(store.clone() as Arc<dyn LedgerStore>)
                .await
                .unwrap();
            let engine = RelayEngine::new(
                Arc::new(ledger),
                test_mapping(),
                Actuators::new(Arc::new(chain_a.clone()), Arc::new(chain_b.clone())),
                ChallengeTimer::new(7 * DAY),
                clock.clone(),
                EngineSettings::default(),
            );
            Self {
                engine,
                chain_a,
                chain_b,
                clock,
                store,
            }
        }

        pub async fn feed(&self, event: SourceEvent) {
            self.engine.handle_source(event).await;
            self.engine.drain().await;
        }

        pub async fn state(&self, hash: &alloy::primitives::B256) -> TransferState {
            self.engine.status(hash).await.unwrap().state
        }
    }

    pub fn watcher_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(5),
            confirmations: 2,
            max_block_range: 100,
            reorg_window: 32,
            start_block: 1,
            backoff: RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        }
    }

    pub fn checkpoint(chain: Chain, number: u64) -> SourceEvent {
        SourceEvent::Checkpoint {
            chain,
            cursor: BlockRef::new(number, B256::repeat_byte(number as u8)),
        }
    }

    /// Store whose transfer writes can be switched off while cursor writes
    /// keep working
    #[derive(Default)]
    pub struct TransferWritesDown {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl TransferWritesDown {
        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LedgerStore for TransferWritesDown {
        async fn load_transfers(&self) -> eyre::Result<Vec<Transfer>> {
            self.inner.load_transfers().await
        }

        async fn save_transfer(&self, transfer: &Transfer) -> eyre::Result<()> {
            if self.down.load(Ordering::SeqCst) {
                eyre::bail!("transfers table unavailable");
            }
            self.inner.save_transfer(transfer).await
        }

        async fn load_cursor(&self, chain: Chain) -> eyre::Result<Option<BlockRef>> {
            self.inner.load_cursor(chain).await
        }

        async fn save_cursor(&self, chain: Chain, cursor: BlockRef) -> eyre::Result<()> {
            self.inner.save_cursor(chain, cursor).await
        }
    }

    /// Poll a source once and hand everything it reports to the engine
    pub async fn pump(bridge: &Bridge, source: &mut EventSource<MockChainReader>) {
        for event in source.poll_once().await.unwrap() {
            bridge.feed(event).await;
        }
    }
}

use helpers::*;

#[tokio::test]
async fn test_deposit_relayed_once() {
    let bridge = Bridge::new().await;
    let hash = deposit_event(7).deposit_hash;

    bridge.feed(deposit_at(100, 7)).await;
    let transfer = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(transfer.state, TransferState::Finalized);
    assert_eq!(transfer.amount, U256::from(1_000_000_000_000_000_000u64));
    assert_eq!(transfer.destination_token, Some(TOKEN_B));

    // Same event again, e.g. after a watcher restart
    bridge.feed(deposit_at(100, 7)).await;
    assert_eq!(bridge.chain_b.submit_count(), 1);
    assert_eq!(bridge.chain_b.applied_count(&hash), 1);
    assert_eq!(
        bridge.store.transfer(&hash).unwrap().state,
        TransferState::Finalized
    );
}

#[tokio::test]
async fn test_concurrent_duplicates_submit_once() {
    let bridge = Bridge::new().await;
    bridge.chain_b.set_submit_delay(Duration::from_millis(20));
    let hash = deposit_event(3).deposit_hash;

    let observations = (0..10).map(|_| {
        let engine = bridge.engine.clone();
        tokio::spawn(async move { engine.handle_source(deposit_at(40, 3)).await })
    });
    for result in futures::future::join_all(observations).await {
        result.unwrap();
    }
    bridge.engine.drain().await;

    assert_eq!(bridge.state(&hash).await, TransferState::Finalized);
    assert_eq!(bridge.chain_b.submit_count(), 1);
}

#[tokio::test]
async fn test_unmapped_token_is_never_actuated() {
    let bridge = Bridge::new().await;
    let event = deposit_event_for(UNMAPPED_TOKEN, U256::from(500u64), 1);
    let hash = event.deposit_hash;

    bridge
        .feed(observed_at(Chain::A, 12, ChainEvent::Deposit(event)))
        .await;

    let transfer = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(transfer.state, TransferState::Failed);
    assert_eq!(transfer.failure, Some(FailureReason::UnsupportedToken));
    assert_eq!(bridge.chain_b.submit_count(), 0);
}

#[tokio::test]
async fn test_withdrawal_released_only_after_challenge_period() {
    let bridge = Bridge::new().await;
    let hash = withdrawal_event(1).withdrawal_hash;

    bridge.feed(withdrawal_at(30, 1)).await;
    assert_eq!(bridge.state(&hash).await, TransferState::AwaitingChallenge);

    bridge.clock.advance(6 * DAY);
    bridge.engine.poll_challenges().await;
    bridge.engine.drain().await;
    assert_eq!(bridge.state(&hash).await, TransferState::AwaitingChallenge);
    assert_eq!(bridge.chain_a.submit_count(), 0);

    bridge.clock.advance(2 * DAY);
    bridge.engine.poll_challenges().await;
    bridge.engine.drain().await;
    assert_eq!(bridge.state(&hash).await, TransferState::Finalized);

    let calls = bridge.chain_a.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        calls[0],
        Action::FinalizeWithdrawal { l1_token, .. } if l1_token == TOKEN_A
    ));
}

#[tokio::test]
async fn test_contested_withdrawal_is_never_released() {
    let bridge = Bridge::new().await;
    let hash = withdrawal_event(2).withdrawal_hash;
    bridge.feed(withdrawal_at(30, 2)).await;

    bridge.clock.advance(3 * DAY);
    let contested = bridge.engine.contest(hash).await.unwrap();
    assert_eq!(contested.failure, Some(FailureReason::Contested));

    bridge.clock.advance(10 * DAY);
    bridge.engine.poll_challenges().await;
    bridge.engine.reconcile().await;
    bridge.engine.drain().await;
    assert_eq!(bridge.state(&hash).await, TransferState::Failed);
    assert_eq!(bridge.chain_a.submit_count(), 0);
    assert!(matches!(
        bridge.engine.retry(hash).await,
        Err(RelayError::RetryForbidden { .. })
    ));
}

#[tokio::test]
async fn test_reorg_rolls_back_and_reobserves_withdrawal() {
    let bridge = Bridge::new().await;
    let reader = MockChainReader::new(Chain::B);
    reader.mine_to(12);
    reader.add_withdrawal(7, 1);
    let hash = withdrawal_event(1).withdrawal_hash;

    let mut source = EventSource::new(reader.clone(), watcher_config(), None);
    pump(&bridge, &mut source).await;
    let first = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(first.state, TransferState::AwaitingChallenge);
    assert_eq!(first.origin_confirmed_at, 7);

    // The withdrawal is orphaned and lands again in block 8
    reader.reorg_from(6);
    reader.remove_deposits_from(6);
    reader.add_withdrawal(8, 1);
    reader.mine_to(14);
    pump(&bridge, &mut source).await;

    let second = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(second.state, TransferState::AwaitingChallenge);
    assert_eq!(second.origin_confirmed_at, 8);
    assert_eq!(second.origin_block_hash, reader.hash_of(8).unwrap());
    assert!(!second.is_flagged());
    assert_eq!(bridge.chain_a.submit_count(), 0);
}

#[tokio::test]
async fn test_orphaned_withdrawal_stays_reorged() {
    let bridge = Bridge::new().await;
    let reader = MockChainReader::new(Chain::B);
    reader.mine_to(12);
    reader.add_withdrawal(7, 1);
    let hash = withdrawal_event(1).withdrawal_hash;

    let mut source = EventSource::new(reader.clone(), watcher_config(), None);
    pump(&bridge, &mut source).await;

    reader.reorg_from(6);
    reader.remove_deposits_from(6);
    reader.mine_to(14);
    pump(&bridge, &mut source).await;
    assert_eq!(bridge.state(&hash).await, TransferState::Reorged);

    bridge.clock.advance(8 * DAY);
    bridge.engine.poll_challenges().await;
    bridge.engine.reconcile().await;
    bridge.engine.drain().await;
    assert_eq!(bridge.state(&hash).await, TransferState::Reorged);
    assert_eq!(bridge.chain_a.submit_count(), 0);
}

#[tokio::test]
async fn test_reorg_after_actuation_flags_transfer() {
    let bridge = Bridge::new().await;
    let reader = MockChainReader::new(Chain::A);
    reader.mine_to(12);
    reader.add_deposit(7, 1);
    let hash = deposit_event(1).deposit_hash;

    let mut source = EventSource::new(reader.clone(), watcher_config(), None);
    pump(&bridge, &mut source).await;
    assert_eq!(bridge.state(&hash).await, TransferState::Finalized);

    reader.reorg_from(6);
    reader.remove_deposits_from(6);
    reader.mine_to(14);
    pump(&bridge, &mut source).await;

    let transfer = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(transfer.state, TransferState::Finalized);
    assert!(matches!(
        transfer.review,
        Some(ReviewFlag::ReorgedAfterActuation { .. })
    ));
    assert_eq!(bridge.engine.summary().await.flagged, 1);
}

#[tokio::test]
async fn test_cursor_is_persisted_on_checkpoint() {
    let bridge = Bridge::new().await;
    let reader = MockChainReader::new(Chain::A);
    reader.mine_to(50);

    let mut source = EventSource::new(reader.clone(), watcher_config(), None);
    pump(&bridge, &mut source).await;

    let cursor = bridge.engine.ledger().load_cursor(Chain::A).await.unwrap();
    assert_eq!(cursor, source.cursor());
    assert_eq!(cursor.map(|c| c.number), Some(48));

    // A new source resumes after the persisted cursor
    reader.add_deposit(49, 4);
    reader.mine_to(60);
    let mut resumed = EventSource::new(reader, watcher_config(), cursor);
    assert_eq!(resumed.next_block(), 49);
    pump(&bridge, &mut resumed).await;
    assert_eq!(
        bridge.state(&deposit_event(4).deposit_hash).await,
        TransferState::Finalized
    );
}

#[tokio::test]
async fn test_recovery_adopts_applied_call_without_resubmitting() {
    let store = Arc::new(MemoryStore::new());
    let mut transfer = sample_deposit();
    transfer.state = TransferState::Actuating;
    transfer.destination_token = Some(TOKEN_B);
    transfer.attempts = 1;
    store.save_transfer(&transfer).await.unwrap();

    // The destination call landed just before the crash
    let chain_b = MockActuator::new(Chain::B);
    chain_b.set_already_applied(&Action::for_transfer(&transfer).unwrap());

    let bridge = Bridge::restart(store.clone(), MockActuator::new(Chain::A), chain_b).await;
    bridge.engine.recover().await;
    bridge.engine.drain().await;

    let hash = transfer.transfer_hash;
    assert_eq!(bridge.state(&hash).await, TransferState::Finalized);
    assert_eq!(bridge.chain_b.submit_count(), 0);
    assert_eq!(bridge.chain_b.applied_count(&hash), 1);
    assert_eq!(store.transfer(&hash).unwrap().state, TransferState::Finalized);
}

#[tokio::test]
async fn test_recovery_resubmits_unapplied_call() {
    let store = Arc::new(MemoryStore::new());
    let mut transfer = sample_deposit();
    transfer.state = TransferState::Actuating;
    transfer.destination_token = Some(TOKEN_B);
    transfer.attempts = 1;
    store.save_transfer(&transfer).await.unwrap();

    let bridge = Bridge::with_store(store).await;
    bridge.engine.recover().await;
    bridge.engine.drain().await;

    let done = bridge.engine.status(&transfer.transfer_hash).await.unwrap();
    assert_eq!(done.state, TransferState::Finalized);
    assert_eq!(done.attempts, 2);
    assert_eq!(bridge.chain_b.submit_count(), 1);
}

#[tokio::test]
async fn test_restart_keeps_challenge_deadline() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let mut transfer = sample_withdrawal();
    transfer.state = TransferState::AwaitingChallenge;
    transfer.destination_token = Some(TOKEN_A);
    transfer.challenge_deadline = Some(now + chrono::Duration::days(1));
    store.save_transfer(&transfer).await.unwrap();

    let bridge = Bridge::with_store(store).await;
    bridge.clock.set(now);
    bridge.engine.recover().await;
    bridge.engine.drain().await;
    assert_eq!(
        bridge.state(&transfer.transfer_hash).await,
        TransferState::AwaitingChallenge
    );

    bridge.clock.advance(2 * DAY);
    bridge.engine.poll_challenges().await;
    bridge.engine.drain().await;
    assert_eq!(
        bridge.state(&transfer.transfer_hash).await,
        TransferState::Finalized
    );
}

#[tokio::test]
async fn test_already_applied_destination_is_adopted() {
    let bridge = Bridge::new().await;
    let hash = deposit_event(9).deposit_hash;
    let mut pending = sample_deposit();
    pending.transfer_hash = hash;
    pending.origin_nonce = U256::from(9u64);
    pending.destination_token = Some(TOKEN_B);
    bridge
        .chain_b
        .set_already_applied(&Action::for_transfer(&pending).unwrap());

    bridge.feed(deposit_at(10, 9)).await;

    let transfer = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(transfer.state, TransferState::Finalized);
    assert!(transfer.destination_tx.is_some());
    assert_eq!(bridge.chain_b.applied_count(&hash), 1);
}

#[tokio::test]
async fn test_operator_retry_through_handle() {
    let bridge = Bridge::new().await;
    bridge
        .chain_b
        .push_submit_error(ActuatorError::Reverted("insufficient liquidity".into()));
    let hash = deposit_event(5).deposit_hash;

    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(bridge.engine.clone().run(rx, shutdown_rx));
    let handle = EngineHandle::new(bridge.engine.clone(), tx.clone());

    tx.send(deposit_at(10, 5).into()).await.unwrap();
    wait_for_state(&bridge, &hash, TransferState::Failed).await;

    handle.retry(hash).await.unwrap();
    wait_for_state(&bridge, &hash, TransferState::Finalized).await;
    assert_eq!(bridge.engine.status(&hash).await.unwrap().attempts, 2);

    shutdown_tx.send(true).unwrap();
    running.await.unwrap().unwrap();
    assert!(matches!(
        handle.retry(hash).await,
        Err(RelayError::EngineStopped)
    ));
}

#[tokio::test]
async fn test_event_source_drives_running_engine() {
    let bridge = Bridge::new().await;
    let reader = MockChainReader::new(Chain::A);
    reader.mine_to(20);
    reader.add_deposit(3, 11);
    let hash = deposit_event(11).deposit_hash;

    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = tokio::spawn(bridge.engine.clone().run(rx, shutdown_rx.clone()));
    let source = EventSource::new(reader, watcher_config(), None);
    let watcher = tokio::spawn(source.run(tx, shutdown_rx));

    wait_for_state(&bridge, &hash, TransferState::Finalized).await;

    // head 20 with two confirmations
    let ledger = bridge.engine.ledger().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while ledger.load_cursor(Chain::A).await.unwrap().map(|c| c.number) != Some(18) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    shutdown_tx.send(true).unwrap();
    watcher.await.unwrap().unwrap();
    engine.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_event_missed_during_store_outage_is_recorded() {
    let bridge = Bridge::new().await;
    let hash = deposit_event(7).deposit_hash;

    bridge.store.set_fail_writes(true);
    bridge.feed(deposit_at(10, 7)).await;
    assert!(bridge.engine.status(&hash).await.is_none());
    assert_eq!(bridge.engine.summary().await.deferred_events, 1);

    bridge.store.set_fail_writes(false);
    bridge.feed(checkpoint(Chain::A, 12)).await;

    assert_eq!(bridge.state(&hash).await, TransferState::Finalized);
    assert_eq!(bridge.chain_b.submit_count(), 1);
    let cursor = bridge.engine.ledger().load_cursor(Chain::A).await.unwrap();
    assert_eq!(cursor.map(|c| c.number), Some(12));
    assert_eq!(bridge.engine.summary().await.deferred_events, 0);
}

#[tokio::test]
async fn test_cursor_held_behind_unrecorded_events() {
    let store = Arc::new(TransferWritesDown::default());
    let ledger = Arc::new(
        TransferLedger::open(store.clone() as Arc<dyn LedgerStore>)
            .await
            .unwrap(),
    );
    let chain_b = MockActuator::new(Chain::B);
    let engine = RelayEngine::new(
        ledger.clone(),
        test_mapping(),
        Actuators::new(
            Arc::new(MockActuator::new(Chain::A)),
            Arc::new(chain_b.clone()),
        ),
        ChallengeTimer::new(7 * DAY),
        Arc::new(ManualClock::new(Utc::now())),
        EngineSettings::default(),
    );
    let first = deposit_event(7).deposit_hash;
    let second = deposit_event(8).deposit_hash;

    store.set_down(true);
    engine.handle_source(deposit_at(10, 7)).await;
    // Queued behind the failed event without being applied
    engine.handle_source(deposit_at(11, 8)).await;
    engine.handle_source(checkpoint(Chain::A, 12)).await;

    assert_eq!(ledger.load_cursor(Chain::A).await.unwrap(), None);
    assert!(engine.status(&first).await.is_none());
    assert!(engine.status(&second).await.is_none());
    assert_eq!(engine.summary().await.deferred_events, 2);

    // Other chain is unaffected
    engine.handle_source(checkpoint(Chain::B, 30)).await;
    assert_eq!(
        ledger.load_cursor(Chain::B).await.unwrap().map(|c| c.number),
        Some(30)
    );

    store.set_down(false);
    engine.sweep().await;
    engine.drain().await;
    assert_eq!(
        engine.status(&first).await.unwrap().state,
        TransferState::Finalized
    );
    assert_eq!(
        engine.status(&second).await.unwrap().state,
        TransferState::Finalized
    );
    assert_eq!(chain_b.submit_count(), 2);

    engine.handle_source(checkpoint(Chain::A, 13)).await;
    assert_eq!(
        ledger.load_cursor(Chain::A).await.unwrap().map(|c| c.number),
        Some(13)
    );
}

#[tokio::test]
async fn test_failed_rollback_replayed_before_reobservation() {
    let bridge = Bridge::new().await;
    let hash = withdrawal_event(1).withdrawal_hash;
    bridge.feed(withdrawal_at(7, 1)).await;
    assert_eq!(bridge.state(&hash).await, TransferState::AwaitingChallenge);

    bridge.store.set_fail_writes(true);
    bridge
        .feed(SourceEvent::Reorg {
            chain: Chain::B,
            below: 6,
        })
        .await;
    bridge.feed(withdrawal_at(8, 1)).await;
    assert_eq!(bridge.engine.summary().await.deferred_events, 2);

    bridge.store.set_fail_writes(false);
    bridge.engine.sweep().await;
    bridge.engine.drain().await;

    let transfer = bridge.engine.status(&hash).await.unwrap();
    assert_eq!(transfer.state, TransferState::AwaitingChallenge);
    assert_eq!(transfer.origin_confirmed_at, 8);
    assert_eq!(bridge.chain_a.submit_count(), 0);
}

async fn wait_for_state(
    bridge: &Bridge,
    hash: &alloy::primitives::B256,
    expected: TransferState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if bridge.engine.status(hash).await.map(|t| t.state) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("transfer {} never reached {}", hash, expected));
}

#[tokio::test]
#[ignore]
async fn test_postgres_store_roundtrip() {
    use bridge_coordinator::db::PgStore;
    use bridge_coordinator::types::BlockRef;

    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("Skipping: DATABASE_URL not set");
        return;
    };
    let store = PgStore::connect(&url).await.unwrap();

    let mut transfer = sample_withdrawal();
    transfer.state = TransferState::AwaitingChallenge;
    transfer.destination_token = Some(TOKEN_A);
    transfer.challenge_deadline = Some(Utc::now());
    store.save_transfer(&transfer).await.unwrap();

    let loaded = store
        .load_transfers()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.transfer_hash == transfer.transfer_hash)
        .unwrap();
    assert_eq!(loaded.state, TransferState::AwaitingChallenge);
    assert_eq!(loaded.amount, transfer.amount);
    assert_eq!(loaded.destination_token, Some(TOKEN_A));

    let cursor = BlockRef::new(1234, transfer.origin_block_hash);
    store.save_cursor(Chain::B, cursor).await.unwrap();
    assert_eq!(store.load_cursor(Chain::B).await.unwrap(), Some(cursor));
    println!("Postgres store OK");
}
