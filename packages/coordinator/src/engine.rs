//! Relay engine
//!
//! Turns confirmed chain events into transfer state transitions and drives
//! each transfer to its destination call:
//!
//! ```text
//! deposits:    Observed -> Validated -> Actuating -> Applied -> Finalized
//! withdrawals: Observed -> Validated -> AwaitingChallenge -> Actuating -> ...
//! ```
//!
//! Every step is a compare-and-swap on the ledger, so a transfer is actuated
//! by exactly one task no matter how often its event is delivered. The
//! destination call itself runs in a spawned task; different transfers are
//! actuated in parallel, bounded per signer by the actuators.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use eyre::Result;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::challenge::{ChallengeTimer, Clock};
use crate::error::RelayError;
use crate::events::{ChainEvent, Command, EngineEvent, ObservedEvent, SourceEvent};
use crate::hash::compute_transfer_hash;
use crate::ledger::{LedgerError, TransferLedger};
use crate::metrics;
use crate::tokens::TokenMapping;
use crate::types::{
    Chain, Direction, FailureReason, ReviewFlag, Transfer, TransferHash, TransferState,
};
use crate::writers::{Action, Actuator, ActuatorError, Actuators, Receipt, TxHandle};

const MIN_WAKE: Duration = Duration::from_millis(250);

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound between challenge sweeps and reconciliation passes
    pub sweep_interval: Duration,
    /// How long shutdown waits for in-flight destination calls
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Snapshot of the engine for the status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub transfers: BTreeMap<TransferState, usize>,
    pub flagged: usize,
    pub in_flight: usize,
    pub deferred_events: usize,
    pub next_challenge_deadline: Option<DateTime<Utc>>,
}

struct Inner {
    ledger: Arc<TransferLedger>,
    tokens: TokenMapping,
    actuators: Actuators,
    timer: ChallengeTimer,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    in_flight: Arc<Mutex<HashSet<TransferHash>>>,
    tasks: Mutex<JoinSet<()>>,
    /// Origin events that could not be recorded, per chain, in arrival order
    deferred: tokio::sync::Mutex<HashMap<Chain, VecDeque<SourceEvent>>>,
}

/// Claim on a transfer's destination call; released on drop
struct InFlight {
    hash: TransferHash,
    set: Arc<Mutex<HashSet<TransferHash>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.hash);
    }
}

#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("tokens", &self.inner.tokens.len())
            .field("challenge_period", &self.inner.timer.period())
            .finish_non_exhaustive()
    }
}

impl RelayEngine {
    pub fn new(
        ledger: Arc<TransferLedger>,
        tokens: TokenMapping,
        actuators: Actuators,
        timer: ChallengeTimer,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                tokens,
                actuators,
                timer,
                clock,
                settings,
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                tasks: Mutex::new(JoinSet::new()),
                deferred: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<TransferLedger> {
        &self.inner.ledger
    }

    pub fn timer(&self) -> &ChallengeTimer {
        &self.inner.timer
    }

    pub async fn status(&self, hash: &TransferHash) -> Option<Transfer> {
        self.inner.ledger.get(hash).await
    }

    pub async fn summary(&self) -> EngineStatus {
        let transfers = self.inner.ledger.snapshot().await;
        let mut counts = BTreeMap::new();
        let mut flagged = 0;
        let mut next_challenge_deadline: Option<DateTime<Utc>> = None;
        for t in &transfers {
            *counts.entry(t.state).or_insert(0) += 1;
            if t.is_flagged() {
                flagged += 1;
            }
            if t.state == TransferState::AwaitingChallenge {
                if let Some(deadline) = t.challenge_deadline {
                    next_challenge_deadline = Some(match next_challenge_deadline {
                        Some(current) => current.min(deadline),
                        None => deadline,
                    });
                }
            }
        }
        EngineStatus {
            transfers: counts,
            flagged,
            in_flight: self.in_flight_count(),
            deferred_events: self.inner.deferred.lock().await.values().map(VecDeque::len).sum(),
            next_challenge_deadline,
        }
    }

    fn in_flight_count(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Consume events until shutdown
    pub async fn run(
        self,
        mut events: mpsc::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            tokens = self.inner.tokens.len(),
            challenge_period_secs = self.inner.timer.period().as_secs(),
            "Relay engine started"
        );

        let every = self.inner.settings.sweep_interval;
        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Only moved earlier by events, so a busy channel cannot push it out
        let challenge_wake = tokio::time::sleep(self.next_wake().await);
        tokio::pin!(challenge_wake);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(event).await;
                        let wake = tokio::time::Instant::now() + self.next_wake().await;
                        if wake < challenge_wake.deadline() {
                            challenge_wake.as_mut().reset(wake);
                        }
                    }
                    None => {
                        info!("All event senders closed");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep().await,
                () = &mut challenge_wake => {
                    self.poll_challenges().await;
                    let wake = tokio::time::Instant::now() + self.next_wake().await;
                    challenge_wake.as_mut().reset(wake);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Relay engine stopped");
        Ok(())
    }

    /// Periodic pass: replay deferred origin events, release due withdrawals
    /// and resume stalled transfers
    pub async fn sweep(&self) {
        self.replay_deferred().await;
        self.poll_challenges().await;
        self.reconcile().await;
        self.refresh_metrics().await;
    }

    /// Time until the earliest challenge deadline, capped by the sweep interval
    async fn next_wake(&self) -> Duration {
        let now = self.inner.clock.now();
        let sweep = self.inner.settings.sweep_interval;
        self.inner
            .ledger
            .in_state(TransferState::AwaitingChallenge)
            .await
            .iter()
            .filter(|t| !t.is_flagged())
            .map(|t| self.inner.timer.remaining(t, now))
            .fold(sweep, Duration::min)
            .max(MIN_WAKE)
    }

    pub async fn handle(&self, event: EngineEvent) {
        match event {
            EngineEvent::Source(event) => self.handle_source(event).await,
            EngineEvent::Command(command) => self.handle_command(command).await,
        }
    }

    /// Apply an origin-chain event.
    ///
    /// An event the ledger failed to store is queued and replayed in order
    /// before anything newer from the same chain. While a chain has queued
    /// events its cursor is not saved, so a restart rescans from before them.
    pub async fn handle_source(&self, event: SourceEvent) {
        let chain = event.chain();
        let mut deferred = self.inner.deferred.lock().await;
        let queue = deferred.entry(chain).or_default();
        if !queue.is_empty() {
            self.replay(chain, queue).await;
        }

        match event {
            SourceEvent::Checkpoint { chain, cursor } => {
                if let Some(pending) = queue.front() {
                    warn!(
                        chain = %chain,
                        block = cursor.number,
                        held_from = first_block(pending),
                        deferred = queue.len(),
                        "Cursor held behind unrecorded events"
                    );
                    return;
                }
                if let Err(e) = self.inner.ledger.save_cursor(chain, cursor).await {
                    error!(chain = %chain, block = cursor.number, error = %e, "Failed to persist cursor");
                }
            }
            event if !queue.is_empty() => queue.push_back(event),
            event => {
                if let Err(e) = self.apply_source(&event).await {
                    error!(
                        chain = %chain,
                        block = first_block(&event),
                        error = %e,
                        "Origin event not recorded, deferring"
                    );
                    queue.push_back(event);
                }
            }
        }
        metrics::DEFERRED_EVENTS
            .with_label_values(&[chain.as_str()])
            .set(queue.len() as i64);
    }

    /// Record an observation or roll back a reorged range.
    ///
    /// Only ledger store failures are returned; anything else concerns a
    /// single transfer and is logged.
    async fn apply_source(&self, event: &SourceEvent) -> Result<(), RelayError> {
        match event {
            SourceEvent::Observed(observed) => match self.observe(observed.clone()).await {
                Err(e) if e.is_store_failure() => Err(e),
                Err(e) => {
                    log_failure(None, &e, "Failed to process bridge event");
                    Ok(())
                }
                Ok(_) => Ok(()),
            },
            SourceEvent::Reorg { chain, below } => {
                let report = self.inner.ledger.rollback_from(*chain, *below).await?;
                for hash in &report.flagged {
                    metrics::record_flag("reorged_after_actuation");
                    warn!(transfer_hash = %hash, chain = %chain, below, "Actuated transfer hit by reorg");
                }
                Ok(())
            }
            SourceEvent::Checkpoint { .. } => Ok(()),
        }
    }

    /// Apply queued events front to back, stopping at the first that fails again
    async fn replay(&self, chain: Chain, queue: &mut VecDeque<SourceEvent>) {
        while let Some(event) = queue.front() {
            if let Err(e) = self.apply_source(event).await {
                debug!(chain = %chain, deferred = queue.len(), error = %e, "Deferred events still blocked");
                return;
            }
            queue.pop_front();
        }
        info!(chain = %chain, "Deferred origin events recorded");
    }

    async fn replay_deferred(&self) {
        let mut deferred = self.inner.deferred.lock().await;
        for (chain, queue) in deferred.iter_mut() {
            if !queue.is_empty() {
                self.replay(*chain, queue).await;
                metrics::DEFERRED_EVENTS
                    .with_label_values(&[chain.as_str()])
                    .set(queue.len() as i64);
            }
        }
    }

    async fn handle_command(&self, command: Command) {
        match command {
            Command::Retry {
                transfer_hash,
                reply,
            } => respond(reply, self.retry(transfer_hash).await),
            Command::Contest {
                transfer_hash,
                reply,
            } => respond(reply, self.contest(transfer_hash).await),
            Command::Resolve {
                transfer_hash,
                reply,
            } => respond(reply, self.resolve(transfer_hash).await),
        }
    }

    /// Record an observed event and push the transfer as far as it can go
    /// without waiting.
    ///
    /// A repeated event returns the existing record unchanged.
    pub async fn observe(&self, observed: ObservedEvent) -> Result<Transfer, RelayError> {
        let (direction, user, origin_token, claimed, amount, nonce, origin_hash) =
            match &observed.event {
                ChainEvent::Deposit(d) => (
                    Direction::DepositAtoB,
                    d.user,
                    d.token,
                    None,
                    d.amount,
                    d.nonce,
                    d.deposit_hash,
                ),
                ChainEvent::WithdrawalInitiated(w) => (
                    Direction::WithdrawalBtoA,
                    w.user,
                    w.l2_token,
                    Some(w.l1_token),
                    w.amount,
                    w.nonce,
                    w.withdrawal_hash,
                ),
            };

        if direction.origin() != observed.chain {
            return Err(RelayError::Irrecoverable(format!(
                "{} event reported by chain {}",
                direction, observed.chain
            )));
        }

        let hash = compute_transfer_hash(direction, &user, &origin_token, &amount, &nonce);
        metrics::record_event(observed.chain, direction);

        let block = observed.block;
        let (transfer, created) = self
            .inner
            .ledger
            .lookup_or_create(hash, || {
                let now = Utc::now();
                Transfer {
                    transfer_hash: hash,
                    direction,
                    user,
                    origin_token,
                    destination_token: None,
                    claimed_destination_token: claimed,
                    amount,
                    origin_nonce: nonce,
                    origin_hash,
                    state: TransferState::Observed,
                    origin_confirmed_at: block.number,
                    origin_block_hash: block.hash,
                    destination_tx: None,
                    destination_applied_at: None,
                    challenge_deadline: None,
                    failure: None,
                    review: None,
                    attempts: 0,
                    created_at: now,
                    updated_at: now,
                }
            })
            .await?;

        let transfer = if created {
            info!(
                transfer_hash = %hash,
                direction = %direction,
                user = %user,
                amount = %amount,
                nonce = %nonce,
                block = block.number,
                "New transfer observed"
            );
            transfer
        } else if transfer.state == TransferState::Reorged {
            info!(transfer_hash = %hash, block = block.number, "Transfer re-observed after reorg");
            self.transition(hash, TransferState::Reorged, TransferState::Observed, |t| {
                t.origin_confirmed_at = block.number;
                t.origin_block_hash = block.hash;
            })
            .await?
        } else {
            metrics::DUPLICATE_EVENTS
                .with_label_values(&[observed.chain.as_str()])
                .inc();
            debug!(
                transfer_hash = %hash,
                state = %transfer.state,
                "Duplicate event, ignoring"
            );
            return Ok(transfer);
        };

        if origin_hash != hash {
            warn!(
                transfer_hash = %hash,
                origin_hash = %origin_hash,
                "Origin chain hash disagrees with canonical derivation"
            );
            return self.fail(&transfer, FailureReason::HashMismatch).await;
        }

        self.validate(transfer).await
    }

    /// Check the token mapping and amount of an `Observed` transfer
    async fn validate(&self, transfer: Transfer) -> Result<Transfer, RelayError> {
        let destination = match self.check(&transfer) {
            Ok(destination) => destination,
            Err(reason) => return self.fail(&transfer, reason).await,
        };

        let validated = self
            .transition(
                transfer.transfer_hash,
                TransferState::Observed,
                TransferState::Validated,
                |t| t.destination_token = Some(destination),
            )
            .await?;
        self.advance(validated).await
    }

    /// Business checks shared by first validation and operator retry
    fn check(&self, transfer: &Transfer) -> Result<alloy::primitives::Address, FailureReason> {
        let destination = self
            .inner
            .tokens
            .destination_for(transfer.direction, &transfer.origin_token)
            .ok_or(FailureReason::UnsupportedToken)?;

        if transfer.amount.is_zero() {
            return Err(FailureReason::InvalidAmount);
        }

        if transfer.direction.is_withdrawal()
            && transfer.claimed_destination_token != Some(destination)
        {
            return Err(FailureReason::TokenMismatch);
        }

        Ok(destination)
    }

    /// Move a `Validated` transfer on: deposits start actuating, withdrawals
    /// enter their challenge window
    async fn advance(&self, transfer: Transfer) -> Result<Transfer, RelayError> {
        match transfer.direction {
            Direction::DepositAtoB => Ok(self
                .start_actuation(transfer.clone())
                .await?
                .unwrap_or(transfer)),
            Direction::WithdrawalBtoA => {
                let deadline = self.inner.timer.deadline_from(self.inner.clock.now());
                let waiting = self
                    .transition(
                        transfer.transfer_hash,
                        TransferState::Validated,
                        TransferState::AwaitingChallenge,
                        |t| {
                            t.challenge_deadline.get_or_insert(deadline);
                        },
                    )
                    .await?;
                info!(
                    transfer_hash = %waiting.transfer_hash,
                    deadline = ?waiting.challenge_deadline,
                    "Withdrawal waiting for challenge period"
                );

                if self.inner.timer.elapsed(&waiting, self.inner.clock.now()) {
                    return Ok(self
                        .start_actuation(waiting.clone())
                        .await?
                        .unwrap_or(waiting));
                }
                Ok(waiting)
            }
        }
    }

    /// Start actuation for every withdrawal whose challenge period has passed.
    ///
    /// Returns the hashes that moved to `Actuating`.
    pub async fn poll_challenges(&self) -> Vec<TransferHash> {
        let now = self.inner.clock.now();
        let due: Vec<Transfer> = self
            .inner
            .ledger
            .in_state(TransferState::AwaitingChallenge)
            .await
            .into_iter()
            .filter(|t| !t.is_flagged() && self.inner.timer.elapsed(t, now))
            .collect();

        let mut started = Vec::new();
        for transfer in due {
            let hash = transfer.transfer_hash;
            match self.start_actuation(transfer).await {
                Ok(Some(_)) => started.push(hash),
                Ok(None) => {}
                Err(e) => log_failure(Some(hash), &e, "Failed to start withdrawal release"),
            }
        }

        if !started.is_empty() {
            info!(count = started.len(), "Challenge periods elapsed, releasing withdrawals");
        }
        started
    }

    /// CAS a `Validated` or `AwaitingChallenge` transfer into `Actuating` and
    /// hand the destination call to a background task.
    ///
    /// Returns `None` when another task already owns the transfer.
    async fn start_actuation(&self, transfer: Transfer) -> Result<Option<Transfer>, RelayError> {
        let hash = transfer.transfer_hash;
        if transfer.is_flagged() {
            return Err(RelayError::Halted(hash));
        }
        let Some(claim) = self.claim(hash) else {
            debug!(transfer_hash = %hash, "Actuation already in flight");
            return Ok(None);
        };

        let action = Action::for_transfer(&transfer).ok_or_else(|| {
            RelayError::Irrecoverable(format!("transfer {} has no destination token", hash))
        })?;

        let actuating = match self
            .transition(hash, transfer.state, TransferState::Actuating, |t| {
                t.attempts += 1
            })
            .await
        {
            Ok(t) => t,
            Err(RelayError::Ledger(LedgerError::Conflict { actual, .. })) => {
                debug!(transfer_hash = %hash, state = %actual, "Lost actuation race");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let engine = self.clone();
        let record = actuating.clone();
        self.spawn(async move {
            let _claim = claim;
            if let Err(e) = engine.submit(record, action).await {
                log_failure(Some(hash), &e, "Destination call failed");
            }
        });

        Ok(Some(actuating))
    }

    fn claim(&self, hash: TransferHash) -> Option<InFlight> {
        let mut set = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !set.insert(hash) {
            return None;
        }
        Some(InFlight {
            hash,
            set: self.inner.in_flight.clone(),
        })
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.spawn(task);
    }

    fn actuator(&self, direction: Direction) -> &Arc<dyn Actuator> {
        self.inner.actuators.for_chain(direction.destination())
    }

    /// Send the destination call for an `Actuating` transfer and follow it to
    /// finality
    async fn submit(&self, transfer: Transfer, action: Action) -> Result<Transfer, RelayError> {
        let hash = transfer.transfer_hash;
        let chain = action.chain();
        let started = Instant::now();

        match self.actuator(transfer.direction).submit(&action).await {
            Ok(handle) => {
                metrics::record_actuation(chain, "submitted");
                let applied = self
                    .transition(hash, TransferState::Actuating, TransferState::Applied, |t| {
                        t.destination_tx = Some(handle.tx_hash);
                        t.destination_applied_at = handle.block_number;
                    })
                    .await?;
                self.finalize(applied, handle, started).await
            }
            Err(ActuatorError::AlreadyApplied) => {
                metrics::record_actuation(chain, "already_applied");
                info!(transfer_hash = %hash, "Destination already applied this transfer");
                self.adopt_applied(transfer, &action, started).await
            }
            Err(ActuatorError::Reverted(reason)) => {
                metrics::record_actuation(chain, "reverted");
                self.fail(&transfer, FailureReason::OnChainRevert(reason.clone()))
                    .await?;
                Err(RelayError::OnChainRevert(reason))
            }
            Err(ActuatorError::Transient(msg)) => {
                metrics::record_actuation(chain, "transient");
                // Stays in Actuating; reconciliation checks the destination
                // before sending again
                Err(RelayError::TransientInfra(msg))
            }
            Err(ActuatorError::Dropped(tx)) => {
                metrics::record_actuation(chain, "dropped");
                self.halt(hash, format!("destination transaction {} dropped", tx))
                    .await
            }
        }
    }

    /// The destination reports the hash as applied: find the applying
    /// transaction and record it
    async fn adopt_applied(
        &self,
        transfer: Transfer,
        action: &Action,
        started: Instant,
    ) -> Result<Transfer, RelayError> {
        let hash = transfer.transfer_hash;
        match self.actuator(transfer.direction).find_applied(action).await {
            Ok(Some(receipt)) => {
                let applied = self.record_applied(&transfer, receipt).await?;
                let handle = receipt.handle(action.chain());
                self.finalize(applied, handle, started).await
            }
            Ok(None) => {
                self.halt(
                    hash,
                    "destination rejected the call as applied but no applied marker was found"
                        .to_string(),
                )
                .await
            }
            Err(e) => Err(RelayError::TransientInfra(e.to_string())),
        }
    }

    async fn record_applied(
        &self,
        transfer: &Transfer,
        receipt: Receipt,
    ) -> Result<Transfer, RelayError> {
        self.transition(
            transfer.transfer_hash,
            transfer.state,
            TransferState::Applied,
            |t| {
                t.destination_tx = Some(receipt.tx_hash);
                t.destination_applied_at = Some(receipt.block_number);
            },
        )
        .await
    }

    /// Wait for an `Applied` transfer's transaction to reach confirmation depth
    async fn finalize(
        &self,
        mut transfer: Transfer,
        mut handle: TxHandle,
        started: Instant,
    ) -> Result<Transfer, RelayError> {
        let hash = transfer.transfer_hash;
        let actuator = self.actuator(transfer.direction);

        loop {
            match actuator.await_finality(&handle).await {
                Ok(receipt) => {
                    let finalized = self
                        .transition(hash, TransferState::Applied, TransferState::Finalized, |t| {
                            t.destination_tx = Some(receipt.tx_hash);
                            t.destination_applied_at = Some(receipt.block_number);
                        })
                        .await?;
                    metrics::record_actuation(handle.chain, "finalized");
                    metrics::ACTUATION_LATENCY
                        .with_label_values(&[transfer.direction.as_str()])
                        .observe(started.elapsed().as_secs_f64());
                    info!(
                        transfer_hash = %hash,
                        tx_hash = %receipt.tx_hash,
                        block = receipt.block_number,
                        "Transfer finalized"
                    );
                    return Ok(finalized);
                }
                Err(ActuatorError::Reverted(reason)) => {
                    metrics::record_actuation(handle.chain, "reverted");
                    self.fail(&transfer, FailureReason::OnChainRevert(reason.clone()))
                        .await?;
                    return Err(RelayError::OnChainRevert(reason));
                }
                Err(ActuatorError::Transient(msg)) => return Err(RelayError::TransientInfra(msg)),
                Err(ActuatorError::Dropped(_)) | Err(ActuatorError::AlreadyApplied) => {}
            }

            // The hash may have been applied by a replacement transaction
            let action = Action::for_transfer(&transfer).ok_or_else(|| {
                RelayError::Irrecoverable(format!("transfer {} has no destination token", hash))
            })?;
            match actuator.find_applied(&action).await {
                Ok(Some(receipt)) if receipt.tx_hash != handle.tx_hash => {
                    info!(
                        transfer_hash = %hash,
                        dropped = %handle.tx_hash,
                        tx_hash = %receipt.tx_hash,
                        "Following replacement destination transaction"
                    );
                    transfer = self
                        .update(hash, TransferState::Applied, |t| {
                            t.destination_tx = Some(receipt.tx_hash);
                            t.destination_applied_at = Some(receipt.block_number);
                        })
                        .await?;
                    handle = receipt.handle(handle.chain);
                }
                Ok(_) => {
                    metrics::record_actuation(handle.chain, "dropped");
                    return self
                        .halt(
                            hash,
                            format!("destination transaction {} dropped", handle.tx_hash),
                        )
                        .await;
                }
                Err(e) => return Err(RelayError::TransientInfra(e.to_string())),
            }
        }
    }

    /// Resume transfers left mid-flight, e.g. by a crash or a transient error.
    ///
    /// `Actuating` transfers are checked against the destination before any
    /// resubmission. Flagged transfers are skipped.
    pub async fn reconcile(&self) -> usize {
        let mut resumed = 0;
        for transfer in self.inner.ledger.snapshot().await {
            if transfer.is_flagged() {
                continue;
            }
            let hash = transfer.transfer_hash;
            let result = match transfer.state {
                TransferState::Observed => self.validate(transfer).await.map(|_| true),
                TransferState::Validated => self.advance(transfer).await.map(|_| true),
                TransferState::Actuating | TransferState::Applied => {
                    Ok(self.resume(transfer))
                }
                _ => Ok(false),
            };
            match result {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => log_failure(Some(hash), &e, "Failed to resume transfer"),
            }
        }
        resumed
    }

    /// Startup recovery: reconcile the ledger and release due withdrawals
    pub async fn recover(&self) -> usize {
        let resumed = self.reconcile().await;
        let released = self.poll_challenges().await.len();
        let counts = self.inner.ledger.counts_by_state().await;
        info!(resumed, released, ?counts, "Recovery complete");
        metrics::set_state_counts(&counts);
        resumed + released
    }

    /// Spawn the continuation of an `Actuating` or `Applied` transfer
    fn resume(&self, transfer: Transfer) -> bool {
        let hash = transfer.transfer_hash;
        let Some(claim) = self.claim(hash) else {
            return false;
        };

        let engine = self.clone();
        self.spawn(async move {
            let _claim = claim;
            if let Err(e) = engine.resume_inner(transfer).await {
                log_failure(Some(hash), &e, "Resumed actuation failed");
            }
        });
        true
    }

    async fn resume_inner(&self, transfer: Transfer) -> Result<Transfer, RelayError> {
        let hash = transfer.transfer_hash;
        let action = Action::for_transfer(&transfer).ok_or_else(|| {
            RelayError::Irrecoverable(format!("transfer {} has no destination token", hash))
        })?;
        let started = Instant::now();

        if transfer.state == TransferState::Applied {
            if let Some(tx_hash) = transfer.destination_tx {
                let handle = TxHandle {
                    chain: action.chain(),
                    tx_hash,
                    block_number: transfer.destination_applied_at,
                };
                return self.finalize(transfer, handle, started).await;
            }
        }

        let applied = self
            .actuator(transfer.direction)
            .find_applied(&action)
            .await
            .map_err(|e| RelayError::TransientInfra(e.to_string()))?;

        match (transfer.state, applied) {
            (_, Some(receipt)) => {
                info!(
                    transfer_hash = %hash,
                    tx_hash = %receipt.tx_hash,
                    "Found earlier destination call, not resubmitting"
                );
                let applied = if transfer.state == TransferState::Applied {
                    self.update(hash, TransferState::Applied, |t| {
                        t.destination_tx = Some(receipt.tx_hash);
                        t.destination_applied_at = Some(receipt.block_number);
                    })
                    .await?
                } else {
                    self.record_applied(&transfer, receipt).await?
                };
                self.finalize(applied, receipt.handle(action.chain()), started)
                    .await
            }
            (TransferState::Actuating, None) => {
                info!(transfer_hash = %hash, attempts = transfer.attempts, "Resubmitting destination call");
                let transfer = self
                    .update(hash, TransferState::Actuating, |t| t.attempts += 1)
                    .await?;
                self.submit(transfer, action).await
            }
            (_, None) => {
                self.halt(hash, "applied transfer has no destination record".to_string())
                    .await
            }
        }
    }

    /// Operator retry of a `Failed` transfer; re-validates before re-attempting
    pub async fn retry(&self, hash: TransferHash) -> Result<Transfer, RelayError> {
        let transfer = self
            .inner
            .ledger
            .get(&hash)
            .await
            .ok_or(RelayError::NotFound(hash))?;

        if transfer.is_flagged() {
            return Err(RelayError::Halted(hash));
        }
        if transfer.state != TransferState::Failed {
            return Err(RelayError::NotRetryable {
                hash,
                state: transfer.state,
            });
        }
        if let Some(reason) = transfer.failure.as_ref().filter(|r| !r.is_retryable()) {
            return Err(RelayError::RetryForbidden {
                hash,
                reason: reason.clone(),
            });
        }

        let destination = match self.check(&transfer) {
            Ok(destination) => destination,
            Err(reason) => {
                self.update(hash, TransferState::Failed, |t| {
                    t.failure = Some(reason.clone())
                })
                .await?;
                return Err(RelayError::ProtocolViolation(reason));
            }
        };

        let validated = self
            .inner
            .ledger
            .retry(hash, |t| t.destination_token = Some(destination))
            .await?;
        metrics::record_transition(validated.direction, TransferState::Validated);
        info!(transfer_hash = %hash, "Operator retry accepted");

        self.advance(validated).await
    }

    /// Contest a withdrawal before it is released
    pub async fn contest(&self, hash: TransferHash) -> Result<Transfer, RelayError> {
        let transfer = self
            .inner
            .ledger
            .get(&hash)
            .await
            .ok_or(RelayError::NotFound(hash))?;

        if !transfer.direction.is_withdrawal() {
            return Err(RelayError::NotContestable {
                hash,
                state: transfer.state,
            });
        }

        match transfer.state {
            TransferState::Observed
            | TransferState::Validated
            | TransferState::AwaitingChallenge => {
                warn!(transfer_hash = %hash, state = %transfer.state, "Withdrawal contested");
                match self.fail(&transfer, FailureReason::Contested).await {
                    Err(RelayError::Ledger(LedgerError::Conflict { actual, .. })) => {
                        Err(RelayError::NotContestable { hash, state: actual })
                    }
                    other => other,
                }
            }
            state if state.is_actuated() => {
                self.inner
                    .ledger
                    .flag(
                        hash,
                        ReviewFlag::Irrecoverable("contested after release started".to_string()),
                    )
                    .await?;
                metrics::record_flag("contested_after_actuation");
                error!(transfer_hash = %hash, state = %state, "Contest arrived after actuation");
                Err(RelayError::NotContestable { hash, state })
            }
            state => Err(RelayError::NotContestable { hash, state }),
        }
    }

    /// Clear an operator-review flag and let automatic processing continue
    pub async fn resolve(&self, hash: TransferHash) -> Result<Transfer, RelayError> {
        let transfer = self
            .inner
            .ledger
            .get(&hash)
            .await
            .ok_or(RelayError::NotFound(hash))?;
        if !transfer.is_flagged() {
            return Err(RelayError::NotFlagged(hash));
        }

        let cleared = self.inner.ledger.clear_flag(hash).await?;
        info!(transfer_hash = %hash, state = %cleared.state, "Review flag cleared");

        match cleared.state {
            TransferState::Observed => self.validate(cleared).await,
            TransferState::Validated => self.advance(cleared).await,
            TransferState::Actuating | TransferState::Applied => {
                self.resume(cleared.clone());
                Ok(cleared)
            }
            _ => Ok(cleared),
        }
    }

    /// Wait for every spawned destination call to finish
    pub async fn drain(&self) {
        loop {
            let mut tasks = {
                let mut guard = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *guard)
            };
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Actuation task panicked");
                }
            }
        }
    }

    /// Give in-flight calls a grace period, then abandon them; recovery picks
    /// them up on the next start
    pub async fn shutdown(&self) {
        let grace = self.inner.settings.shutdown_grace;
        if tokio::time::timeout(grace, self.drain()).await.is_err() {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            warn!(
                remaining = tasks.len(),
                "Abandoning in-flight destination calls at shutdown"
            );
            tasks.abort_all();
        }
    }

    pub async fn refresh_metrics(&self) {
        let counts = self.inner.ledger.counts_by_state().await;
        metrics::set_state_counts(&counts);
    }

    async fn transition<F>(
        &self,
        hash: TransferHash,
        from: TransferState,
        to: TransferState,
        mutate: F,
    ) -> Result<Transfer, RelayError>
    where
        F: FnOnce(&mut Transfer),
    {
        let transfer = self.inner.ledger.transition(hash, from, to, mutate).await?;
        metrics::record_transition(transfer.direction, to);
        debug!(transfer_hash = %hash, from = %from, to = %to, "Transition");
        Ok(transfer)
    }

    async fn update<F>(
        &self,
        hash: TransferHash,
        expected: TransferState,
        mutate: F,
    ) -> Result<Transfer, RelayError>
    where
        F: FnOnce(&mut Transfer),
    {
        Ok(self.inner.ledger.update(hash, expected, mutate).await?)
    }

    async fn fail(
        &self,
        transfer: &Transfer,
        reason: FailureReason,
    ) -> Result<Transfer, RelayError> {
        warn!(
            transfer_hash = %transfer.transfer_hash,
            from = %transfer.state,
            reason = %reason,
            "Transfer failed"
        );
        self.transition(
            transfer.transfer_hash,
            transfer.state,
            TransferState::Failed,
            |t| t.failure = Some(reason),
        )
        .await
    }

    /// Flag a transfer as irrecoverable; it is skipped until resolved
    async fn halt(&self, hash: TransferHash, reason: String) -> Result<Transfer, RelayError> {
        error!(transfer_hash = %hash, reason = %reason, "Transfer halted for operator review");
        metrics::record_flag("irrecoverable");
        self.inner
            .ledger
            .flag(hash, ReviewFlag::Irrecoverable(reason))
            .await?;
        Err(RelayError::Halted(hash))
    }
}

fn respond(reply: oneshot::Sender<Result<Transfer, RelayError>>, result: Result<Transfer, RelayError>) {
    if reply.send(result).is_err() {
        debug!("Command caller went away before the reply");
    }
}

fn first_block(event: &SourceEvent) -> u64 {
    match event {
        SourceEvent::Observed(observed) => observed.block.number,
        SourceEvent::Reorg { below, .. } => *below,
        SourceEvent::Checkpoint { cursor, .. } => cursor.number,
    }
}

fn log_failure(hash: Option<TransferHash>, error: &RelayError, message: &str) {
    match error {
        RelayError::TransientInfra(_) | RelayError::OnChainRevert(_) => {
            warn!(transfer_hash = ?hash, error = %error, "{}", message)
        }
        RelayError::Halted(_) | RelayError::Ledger(LedgerError::Conflict { .. }) => {
            debug!(transfer_hash = ?hash, error = %error, "{}", message)
        }
        _ => error!(transfer_hash = ?hash, error = %error, "{}", message),
    }
}

/// Client side of the engine's command channel
#[derive(Debug, Clone)]
pub struct EngineHandle {
    engine: RelayEngine,
    commands: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn new(engine: RelayEngine, commands: mpsc::Sender<EngineEvent>) -> Self {
        Self { engine, commands }
    }

    pub async fn status(&self, hash: &TransferHash) -> Option<Transfer> {
        self.engine.status(hash).await
    }

    pub async fn summary(&self) -> EngineStatus {
        self.engine.summary().await
    }

    pub async fn retry(&self, transfer_hash: TransferHash) -> Result<Transfer, RelayError> {
        self.send(|reply| Command::Retry {
            transfer_hash,
            reply,
        })
        .await
    }

    pub async fn contest(&self, transfer_hash: TransferHash) -> Result<Transfer, RelayError> {
        self.send(|reply| Command::Contest {
            transfer_hash,
            reply,
        })
        .await
    }

    pub async fn resolve(&self, transfer_hash: TransferHash) -> Result<Transfer, RelayError> {
        self.send(|reply| Command::Resolve {
            transfer_hash,
            reply,
        })
        .await
    }

    async fn send<F>(&self, build: F) -> Result<Transfer, RelayError>
    where
        F: FnOnce(oneshot::Sender<Result<Transfer, RelayError>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineEvent::Command(build(tx)))
            .await
            .map_err(|_| RelayError::EngineStopped)?;
        rx.await.map_err(|_| RelayError::EngineStopped)?
    }
}
