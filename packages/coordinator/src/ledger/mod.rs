//! Transfer ledger
//!
//! The ledger exclusively owns [`Transfer`] records. Callers get copies; every
//! change goes through a compare-and-swap on the record's current state, which
//! is the only synchronization point between the engine's concurrent tasks.
//!
//! Each mutation is applied to a copy, written through to the
//! [`LedgerStore`], and only then committed in memory. A store failure leaves
//! the in-memory record untouched.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod store;

pub use store::{LedgerStore, MemoryStore};

use crate::types::{BlockRef, Chain, FailureReason, ReviewFlag, Transfer, TransferHash, TransferState};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transfer {0} not found")]
    NotFound(TransferHash),

    #[error("transfer {hash} is {actual}, expected {expected}")]
    Conflict {
        hash: TransferHash,
        expected: TransferState,
        actual: TransferState,
    },

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: TransferState,
        to: TransferState,
    },

    #[error("failure {0} cannot be retried")]
    NotRetryable(FailureReason),

    #[error("ledger store error: {0}")]
    Store(String),
}

impl LedgerError {
    fn store(err: eyre::Report) -> Self {
        LedgerError::Store(format!("{:#}", err))
    }
}

/// Outcome of rolling back an orphaned origin range
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    /// Moved to `Reorged`
    pub rolled_back: Vec<TransferHash>,
    /// Already actuated; flagged for operator review instead
    pub flagged: Vec<TransferHash>,
}

pub struct TransferLedger {
    records: Mutex<HashMap<TransferHash, Transfer>>,
    store: Arc<dyn LedgerStore>,
}

impl std::fmt::Debug for TransferLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferLedger").finish_non_exhaustive()
    }
}

impl TransferLedger {
    /// Open a ledger over `store`, loading every persisted transfer
    pub async fn open(store: Arc<dyn LedgerStore>) -> eyre::Result<Self> {
        let transfers = store.load_transfers().await?;
        let count = transfers.len();
        let records = transfers
            .into_iter()
            .map(|t| (t.transfer_hash, t))
            .collect::<HashMap<_, _>>();

        info!(transfers = count, "Loaded transfer ledger");

        Ok(Self {
            records: Mutex::new(records),
            store,
        })
    }

    /// Empty ledger backed by a fresh [`MemoryStore`]
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Atomic check-and-insert.
    ///
    /// Returns the existing record untouched if the hash is known, otherwise
    /// persists `build()` in `Observed` and returns it. The flag is `true`
    /// only for the caller that created the record.
    pub async fn lookup_or_create<F>(
        &self,
        hash: TransferHash,
        build: F,
    ) -> Result<(Transfer, bool), LedgerError>
    where
        F: FnOnce() -> Transfer,
    {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&hash) {
            return Ok((existing.clone(), false));
        }

        let mut transfer = build();
        transfer.transfer_hash = hash;
        transfer.state = TransferState::Observed;

        self.store
            .save_transfer(&transfer)
            .await
            .map_err(LedgerError::store)?;
        records.insert(hash, transfer.clone());

        debug!(transfer_hash = %hash, direction = %transfer.direction, "Created transfer");
        Ok((transfer, true))
    }

    /// Compare-and-swap `from → to`, applying `mutate` to the record on success
    pub async fn transition<F>(
        &self,
        hash: TransferHash,
        from: TransferState,
        to: TransferState,
        mutate: F,
    ) -> Result<Transfer, LedgerError>
    where
        F: FnOnce(&mut Transfer),
    {
        if !from.can_advance_to(to) {
            return Err(LedgerError::IllegalTransition { from, to });
        }

        let mut records = self.records.lock().await;
        let current = Self::expect_state(&records, hash, from)?;

        let mut next = current.clone();
        next.state = to;
        mutate(&mut next);
        next.state = to;
        next.updated_at = Utc::now();

        self.commit(&mut records, next).await
    }

    /// Mutate a record in place without changing its state, provided it is
    /// still in `expected`
    pub async fn update<F>(
        &self,
        hash: TransferHash,
        expected: TransferState,
        mutate: F,
    ) -> Result<Transfer, LedgerError>
    where
        F: FnOnce(&mut Transfer),
    {
        let mut records = self.records.lock().await;
        let current = Self::expect_state(&records, hash, expected)?;

        let mut next = current.clone();
        mutate(&mut next);
        next.state = expected;
        next.updated_at = Utc::now();

        self.commit(&mut records, next).await
    }

    /// Operator retry: `Failed → Validated`, the one backward edge outside reorgs
    pub async fn retry<F>(&self, hash: TransferHash, mutate: F) -> Result<Transfer, LedgerError>
    where
        F: FnOnce(&mut Transfer),
    {
        let mut records = self.records.lock().await;
        let current = Self::expect_state(&records, hash, TransferState::Failed)?;

        if let Some(reason) = &current.failure {
            if !reason.is_retryable() {
                return Err(LedgerError::NotRetryable(reason.clone()));
            }
        }

        let mut next = current.clone();
        next.failure = None;
        next.destination_tx = None;
        next.destination_applied_at = None;
        mutate(&mut next);
        next.state = TransferState::Validated;
        next.updated_at = Utc::now();

        self.commit(&mut records, next).await
    }

    /// Set the review flag on a record, whatever its state
    pub async fn flag(&self, hash: TransferHash, flag: ReviewFlag) -> Result<Transfer, LedgerError> {
        let mut records = self.records.lock().await;
        let current = records.get(&hash).ok_or(LedgerError::NotFound(hash))?;

        let mut next = current.clone();
        next.review = Some(flag);
        next.updated_at = Utc::now();

        self.commit(&mut records, next).await
    }

    pub async fn clear_flag(&self, hash: TransferHash) -> Result<Transfer, LedgerError> {
        let mut records = self.records.lock().await;
        let current = records.get(&hash).ok_or(LedgerError::NotFound(hash))?;

        let mut next = current.clone();
        next.review = None;
        next.updated_at = Utc::now();

        self.commit(&mut records, next).await
    }

    /// Roll back every transfer originating on `chain` at or above block `below`.
    ///
    /// Records that have not been actuated return to `Reorged` and wait to be
    /// observed again. Records that may already have a destination effect are
    /// left in place and flagged. Contested failures keep their verdict.
    pub async fn rollback_from(
        &self,
        chain: Chain,
        below: u64,
    ) -> Result<RollbackReport, LedgerError> {
        let mut records = self.records.lock().await;
        let mut report = RollbackReport::default();
        let mut changed = Vec::new();
        let now = Utc::now();

        for transfer in records.values() {
            if transfer.direction.origin() != chain || transfer.origin_confirmed_at < below {
                continue;
            }

            let mut next = transfer.clone();
            match transfer.state {
                TransferState::Reorged => continue,
                TransferState::Failed if transfer.failure == Some(FailureReason::Contested) => {
                    continue
                }
                TransferState::Observed
                | TransferState::Validated
                | TransferState::AwaitingChallenge
                | TransferState::Failed => {
                    next.state = TransferState::Reorged;
                    next.failure = None;
                    next.destination_token = None;
                    next.challenge_deadline = None;
                    report.rolled_back.push(transfer.transfer_hash);
                }
                TransferState::Actuating | TransferState::Applied | TransferState::Finalized => {
                    if transfer.is_flagged() {
                        continue;
                    }
                    next.review = Some(ReviewFlag::ReorgedAfterActuation { below });
                    report.flagged.push(transfer.transfer_hash);
                }
            }
            next.updated_at = now;
            changed.push(next);
        }

        if changed.is_empty() {
            return Ok(report);
        }

        self.store
            .save_transfers(&changed)
            .await
            .map_err(LedgerError::store)?;
        for transfer in changed {
            records.insert(transfer.transfer_hash, transfer);
        }

        if !report.flagged.is_empty() {
            warn!(
                chain = %chain,
                below,
                flagged = report.flagged.len(),
                "Reorg reached actuated transfers; flagged for review"
            );
        }
        info!(
            chain = %chain,
            below,
            rolled_back = report.rolled_back.len(),
            "Rolled back transfers after reorg"
        );

        Ok(report)
    }

    pub async fn get(&self, hash: &TransferHash) -> Option<Transfer> {
        self.records.lock().await.get(hash).cloned()
    }

    /// Copies of every record
    pub async fn snapshot(&self) -> Vec<Transfer> {
        self.records.lock().await.values().cloned().collect()
    }

    pub async fn in_state(&self, state: TransferState) -> Vec<Transfer> {
        self.records
            .lock()
            .await
            .values()
            .filter(|t| t.state == state)
            .cloned()
            .collect()
    }

    pub async fn counts_by_state(&self) -> BTreeMap<TransferState, usize> {
        let mut counts = BTreeMap::new();
        for transfer in self.records.lock().await.values() {
            *counts.entry(transfer.state).or_insert(0) += 1;
        }
        counts
    }

    pub async fn load_cursor(&self, chain: Chain) -> eyre::Result<Option<BlockRef>> {
        self.store.load_cursor(chain).await
    }

    pub async fn save_cursor(&self, chain: Chain, cursor: BlockRef) -> eyre::Result<()> {
        self.store.save_cursor(chain, cursor).await
    }

    fn expect_state(
        records: &HashMap<TransferHash, Transfer>,
        hash: TransferHash,
        expected: TransferState,
    ) -> Result<&Transfer, LedgerError> {
        let current = records.get(&hash).ok_or(LedgerError::NotFound(hash))?;
        if current.state != expected {
            return Err(LedgerError::Conflict {
                hash,
                expected,
                actual: current.state,
            });
        }
        Ok(current)
    }

    async fn commit(
        &self,
        records: &mut HashMap<TransferHash, Transfer>,
        next: Transfer,
    ) -> Result<Transfer, LedgerError> {
        self.store
            .save_transfer(&next)
            .await
            .map_err(LedgerError::store)?;
        records.insert(next.transfer_hash, next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_deposit, sample_withdrawal};

    #[tokio::test]
    async fn test_lookup_or_create_is_idempotent() {
        let ledger = TransferLedger::in_memory();
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;

        let (first, created) = ledger
            .lookup_or_create(hash, || transfer.clone())
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.state, TransferState::Observed);

        let (second, created) = ledger
            .lookup_or_create(hash, || panic!("builder must not run for a known hash"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let ledger = TransferLedger::in_memory();
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;
        ledger.lookup_or_create(hash, || transfer).await.unwrap();

        let validated = ledger
            .transition(hash, TransferState::Observed, TransferState::Validated, |_| {})
            .await
            .unwrap();
        assert_eq!(validated.state, TransferState::Validated);

        let err = ledger
            .transition(hash, TransferState::Observed, TransferState::Validated, |_| {})
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Conflict {
                hash,
                expected: TransferState::Observed,
                actual: TransferState::Validated,
            }
        );
    }

    #[tokio::test]
    async fn test_only_one_concurrent_transition_wins() {
        let ledger = Arc::new(TransferLedger::in_memory());
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;
        ledger.lookup_or_create(hash, || transfer).await.unwrap();
        ledger
            .transition(hash, TransferState::Observed, TransferState::Validated, |_| {})
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .transition(hash, TransferState::Validated, TransferState::Actuating, |_| {})
                    .await
                    .is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let ledger = TransferLedger::in_memory();
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;
        ledger.lookup_or_create(hash, || transfer).await.unwrap();

        let err = ledger
            .transition(hash, TransferState::Observed, TransferState::Finalized, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_memory_untouched() {
        let store = Arc::new(MemoryStore::new());
        let ledger = TransferLedger::open(store.clone()).await.unwrap();
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;
        ledger.lookup_or_create(hash, || transfer).await.unwrap();

        store.set_fail_writes(true);
        let err = ledger
            .transition(hash, TransferState::Observed, TransferState::Validated, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)));
        assert_eq!(ledger.get(&hash).await.unwrap().state, TransferState::Observed);

        store.set_fail_writes(false);
        ledger
            .transition(hash, TransferState::Observed, TransferState::Validated, |_| {})
            .await
            .unwrap();
        assert_eq!(
            store.transfer(&hash).unwrap().state,
            TransferState::Validated
        );
    }

    #[tokio::test]
    async fn test_reopen_restores_records() {
        let store = Arc::new(MemoryStore::new());
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;
        {
            let ledger = TransferLedger::open(store.clone()).await.unwrap();
            ledger.lookup_or_create(hash, || transfer).await.unwrap();
            ledger
                .transition(hash, TransferState::Observed, TransferState::Validated, |_| {})
                .await
                .unwrap();
        }

        let reopened = TransferLedger::open(store).await.unwrap();
        assert_eq!(
            reopened.get(&hash).await.unwrap().state,
            TransferState::Validated
        );
    }

    #[tokio::test]
    async fn test_rollback_spares_actuated_and_other_chain() {
        let ledger = TransferLedger::in_memory();

        let mut early = sample_deposit();
        early.origin_nonce = alloy::primitives::U256::from(1u64);
        early.transfer_hash = crate::hash::transfer_hash_of(&early);
        early.origin_confirmed_at = 90;

        let mut late = sample_deposit();
        late.origin_nonce = alloy::primitives::U256::from(2u64);
        late.transfer_hash = crate::hash::transfer_hash_of(&late);
        late.origin_confirmed_at = 105;

        let mut actuated = sample_deposit();
        actuated.origin_nonce = alloy::primitives::U256::from(3u64);
        actuated.transfer_hash = crate::hash::transfer_hash_of(&actuated);
        actuated.origin_confirmed_at = 110;

        let mut withdrawal = sample_withdrawal();
        withdrawal.origin_confirmed_at = 120;

        for t in [&early, &late, &actuated, &withdrawal] {
            let t = t.clone();
            ledger.lookup_or_create(t.transfer_hash, || t).await.unwrap();
        }
        ledger
            .transition(
                late.transfer_hash,
                TransferState::Observed,
                TransferState::Validated,
                |_| {},
            )
            .await
            .unwrap();
        ledger
            .transition(
                actuated.transfer_hash,
                TransferState::Observed,
                TransferState::Validated,
                |_| {},
            )
            .await
            .unwrap();
        ledger
            .transition(
                actuated.transfer_hash,
                TransferState::Validated,
                TransferState::Actuating,
                |_| {},
            )
            .await
            .unwrap();

        let report = ledger.rollback_from(Chain::A, 100).await.unwrap();
        assert_eq!(report.rolled_back, vec![late.transfer_hash]);
        assert_eq!(report.flagged, vec![actuated.transfer_hash]);

        assert_eq!(
            ledger.get(&early.transfer_hash).await.unwrap().state,
            TransferState::Observed
        );
        assert_eq!(
            ledger.get(&late.transfer_hash).await.unwrap().state,
            TransferState::Reorged
        );
        let actuated = ledger.get(&actuated.transfer_hash).await.unwrap();
        assert_eq!(actuated.state, TransferState::Actuating);
        assert_eq!(
            actuated.review,
            Some(ReviewFlag::ReorgedAfterActuation { below: 100 })
        );
        assert_eq!(
            ledger.get(&withdrawal.transfer_hash).await.unwrap().state,
            TransferState::Observed
        );
    }

    #[tokio::test]
    async fn test_retry_only_from_failed() {
        let ledger = TransferLedger::in_memory();
        let transfer = sample_deposit();
        let hash = transfer.transfer_hash;
        ledger.lookup_or_create(hash, || transfer).await.unwrap();

        assert!(matches!(
            ledger.retry(hash, |_| {}).await,
            Err(LedgerError::Conflict { .. })
        ));

        ledger
            .transition(hash, TransferState::Observed, TransferState::Failed, |t| {
                t.failure = Some(FailureReason::Contested);
            })
            .await
            .unwrap();
        assert!(matches!(
            ledger.retry(hash, |_| {}).await,
            Err(LedgerError::NotRetryable(FailureReason::Contested))
        ));
    }

    #[tokio::test]
    async fn test_counts_by_state() {
        let ledger = TransferLedger::in_memory();
        let d = sample_deposit();
        let w = sample_withdrawal();
        ledger.lookup_or_create(d.transfer_hash, || d).await.unwrap();
        ledger.lookup_or_create(w.transfer_hash, || w).await.unwrap();

        let counts = ledger.counts_by_state().await;
        assert_eq!(counts.get(&TransferState::Observed), Some(&2));
    }
}
