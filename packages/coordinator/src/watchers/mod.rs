//! Chain event sources
//!
//! An [`EventSource`] turns a [`ChainReader`] into an ordered stream of
//! confirmed bridge events. It only reports blocks at or below
//! `head - confirmations`, remembers the hashes of blocks it has reported, and
//! compares them against the chain on every poll. When a remembered block is no
//! longer canonical it reports a reorg and rewinds to the fork point.
//!
//! Events are followed by a checkpoint naming the last block covered. The
//! engine persists that checkpoint only after handling everything before it,
//! so a restart resumes without skipping blocks. Duplicates after a restart are
//! expected and absorbed by the ledger.

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub mod evm;

pub use evm::EvmChainReader;

use crate::events::{EngineEvent, ObservedEvent, SourceEvent};
use crate::metrics;
use crate::types::{BlockRef, Chain};
use crate::writers::RetryConfig;

/// Read access to one chain's bridge contract
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn chain(&self) -> Chain;

    /// Latest block number
    async fn head(&self) -> Result<u64>;

    /// Hash of the canonical block at `number`, if the node knows it
    async fn block_hash(&self, number: u64) -> Result<Option<B256>>;

    /// Bridge events in `[from, to]`
    async fn events(&self, from: u64, to: u64) -> Result<Vec<ObservedEvent>>;

    /// Called after a transport error, before the next attempt
    async fn reconnect(&self) {}
}

/// Event watcher configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Poll interval between checks
    pub poll_interval: Duration,
    /// Number of confirmations before considering a block final
    pub confirmations: u64,
    /// Maximum block range per query (to avoid RPC limits)
    pub max_block_range: u64,
    /// Number of reported block hashes kept for reorg detection
    pub reorg_window: usize,
    /// First block to scan when no cursor has been persisted
    pub start_block: u64,
    /// Backoff after transport errors
    pub backoff: RetryConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            confirmations: 1,
            max_block_range: 10_000,
            reorg_window: 128,
            start_block: 0,
            backoff: RetryConfig::default(),
        }
    }
}

pub struct EventSource<R> {
    reader: R,
    config: WatcherConfig,
    cursor: Option<BlockRef>,
    next_block: u64,
    recent: BTreeMap<u64, B256>,
    caught_up: bool,
}

impl<R: ChainReader> EventSource<R> {
    /// Create a source that resumes after `resume`, or starts at the configured
    /// start block when there is no persisted cursor
    pub fn new(reader: R, config: WatcherConfig, resume: Option<BlockRef>) -> Self {
        let mut recent = BTreeMap::new();
        let next_block = match resume {
            Some(cursor) => {
                recent.insert(cursor.number, cursor.hash);
                cursor.number + 1
            }
            None => config.start_block,
        };

        Self {
            reader,
            config,
            cursor: resume,
            next_block,
            recent,
            caught_up: false,
        }
    }

    pub fn chain(&self) -> Chain {
        self.reader.chain()
    }

    /// Last block fully reported
    pub fn cursor(&self) -> Option<BlockRef> {
        self.cursor
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Whether the last poll reached the confirmed head
    pub fn is_caught_up(&self) -> bool {
        self.caught_up
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    /// Run one detection and scan step
    pub async fn poll_once(&mut self) -> Result<Vec<SourceEvent>> {
        let mut out = Vec::new();

        if let Some(reorg) = self.detect_reorg().await? {
            out.extend(reorg);
        }

        let head = self.reader.head().await?;
        let safe = head.saturating_sub(self.config.confirmations);
        if safe < self.next_block {
            self.caught_up = true;
            return Ok(out);
        }

        let range = self.config.max_block_range.max(1);
        let from = self.next_block;
        let to = safe.min(from.saturating_add(range - 1));

        let to_hash = self
            .reader
            .block_hash(to)
            .await?
            .ok_or_else(|| eyre!("block {} on chain {} not available", to, self.chain()))?;

        let mut events = self.reader.events(from, to).await?;
        events.retain(|e| e.block.number >= from && e.block.number <= to);
        events.sort_by_key(|e| (e.block.number, e.log_index));

        if !events.is_empty() {
            info!(
                chain = %self.chain(),
                from_block = from,
                to_block = to,
                count = events.len(),
                "Found bridge events"
            );
        } else {
            debug!(chain = %self.chain(), from_block = from, to_block = to, "Scanned blocks");
        }

        for event in events {
            self.recent.insert(event.block.number, event.block.hash);
            out.push(SourceEvent::Observed(event));
        }

        let cursor = BlockRef::new(to, to_hash);
        self.recent.insert(to, to_hash);
        while self.recent.len() > self.config.reorg_window.max(1) {
            self.recent.pop_first();
        }

        self.cursor = Some(cursor);
        self.next_block = to + 1;
        self.caught_up = to >= safe;

        metrics::LATEST_BLOCK
            .with_label_values(&[self.chain().as_str()])
            .set(to as i64);

        out.push(SourceEvent::Checkpoint {
            chain: self.chain(),
            cursor,
        });
        Ok(out)
    }

    /// Compare the newest reported block against the chain; on mismatch find
    /// the highest remembered block that is still canonical and rewind to it
    async fn detect_reorg(&mut self) -> Result<Option<Vec<SourceEvent>>> {
        let Some((&newest, &recorded)) = self.recent.last_key_value() else {
            return Ok(None);
        };

        if self.reader.block_hash(newest).await? == Some(recorded) {
            return Ok(None);
        }

        let mut fork_point: Option<BlockRef> = None;
        let remembered: Vec<(u64, B256)> = self.recent.iter().rev().map(|(n, h)| (*n, *h)).collect();
        for (number, hash) in remembered.into_iter().skip(1) {
            if self.reader.block_hash(number).await? == Some(hash) {
                fork_point = Some(BlockRef::new(number, hash));
                break;
            }
        }

        let below = match fork_point {
            Some(block) => block.number + 1,
            None => {
                let oldest = self.recent.keys().next().copied().unwrap_or(newest);
                warn!(
                    chain = %self.chain(),
                    oldest_remembered = oldest,
                    "Reorg deeper than the remembered window"
                );
                oldest
            }
        };

        warn!(
            chain = %self.chain(),
            below,
            previous_cursor = newest,
            "Chain reorg detected, rewinding"
        );
        metrics::REORGS
            .with_label_values(&[self.chain().as_str()])
            .inc();

        self.recent.retain(|n, _| *n < below);
        self.next_block = below;
        self.cursor = fork_point;

        let mut out = vec![SourceEvent::Reorg {
            chain: self.chain(),
            below,
        }];
        if let Some(cursor) = fork_point {
            out.push(SourceEvent::Checkpoint {
                chain: self.chain(),
                cursor,
            });
        }
        Ok(Some(out))
    }

    /// Poll until shutdown, forwarding everything to `sink`.
    ///
    /// Transport errors are absorbed with backoff; the reader is asked to
    /// reconnect before each retry.
    pub async fn run(
        mut self,
        sink: mpsc::Sender<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let chain = self.chain();
        info!(chain = %chain, next_block = self.next_block, "Event source started");

        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.poll_once().await {
                Ok(events) => {
                    failures = 0;
                    for event in events {
                        if sink.send(event.into()).await.is_err() {
                            info!(chain = %chain, "Engine channel closed, stopping event source");
                            return Ok(());
                        }
                    }
                    if self.caught_up {
                        self.config.poll_interval
                    } else {
                        Duration::ZERO
                    }
                }
                Err(e) => {
                    let backoff = self.config.backoff.backoff_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        chain = %chain,
                        error = %e,
                        attempt = failures,
                        ?backoff,
                        "Event source poll failed, reconnecting"
                    );
                    metrics::SOURCE_ERRORS
                        .with_label_values(&[chain.as_str()])
                        .inc();
                    self.reader.reconnect().await;
                    backoff
                }
            };

            if wait.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(chain = %chain, cursor = ?self.cursor, "Event source stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChainReader;

    fn config() -> WatcherConfig {
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

    fn observed(events: &[SourceEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                SourceEvent::Observed(o) => Some(o.block.number),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_only_confirmed_blocks_are_reported() {
        let reader = MockChainReader::new(Chain::A);
        reader.mine_to(10);
        reader.add_deposit(5, 1);
        reader.add_deposit(9, 2);

        let mut source = EventSource::new(reader.clone(), config(), None);
        let events = source.poll_once().await.unwrap();

        // head 10, two confirmations: blocks 1..=8
        assert_eq!(observed(&events), vec![5]);
        assert!(matches!(
            events.last(),
            Some(SourceEvent::Checkpoint { cursor, .. }) if cursor.number == 8
        ));

        reader.mine_to(11);
        let events = source.poll_once().await.unwrap();
        assert_eq!(observed(&events), vec![9]);
    }

    #[tokio::test]
    async fn test_range_is_chunked() {
        let reader = MockChainReader::new(Chain::A);
        reader.mine_to(300);
        let mut cfg = config();
        cfg.max_block_range = 100;

        let mut source = EventSource::new(reader, cfg, None);
        source.poll_once().await.unwrap();
        assert_eq!(source.cursor().unwrap().number, 100);
        assert!(!source.is_caught_up());
        source.poll_once().await.unwrap();
        source.poll_once().await.unwrap();
        assert_eq!(source.cursor().unwrap().number, 298);
        assert!(source.is_caught_up());
    }

    #[tokio::test]
    async fn test_resume_from_cursor() {
        let reader = MockChainReader::new(Chain::A);
        reader.mine_to(20);
        reader.add_deposit(4, 1);
        reader.add_deposit(12, 2);

        let resume = BlockRef::new(10, reader.hash_of(10).unwrap());
        let mut source = EventSource::new(reader, config(), Some(resume));
        let events = source.poll_once().await.unwrap();
        assert_eq!(observed(&events), vec![12]);
    }

    #[tokio::test]
    async fn test_reorg_is_reported_and_rescanned() {
        let reader = MockChainReader::new(Chain::A);
        reader.mine_to(12);
        reader.add_deposit(7, 1);

        let mut source = EventSource::new(reader.clone(), config(), None);
        let events = source.poll_once().await.unwrap();
        assert_eq!(observed(&events), vec![7]);

        // Blocks 6.. replaced; the deposit moves to block 8
        reader.reorg_from(6);
        reader.remove_deposits_from(6);
        reader.add_deposit(8, 1);
        reader.mine_to(14);

        let events = source.poll_once().await.unwrap();
        let below = events.iter().find_map(|e| match e {
            SourceEvent::Reorg { below, .. } => Some(*below),
            _ => None,
        });
        // Neither remembered block (7, 10) survived, so the rewind goes to the
        // oldest one
        assert_eq!(below, Some(7));
        assert_eq!(observed(&events), vec![8]);
    }

    #[tokio::test]
    async fn test_shallow_reorg_rewinds_to_fork_point() {
        let reader = MockChainReader::new(Chain::A);
        reader.mine_to(10);
        reader.add_deposit(3, 1);

        let mut source = EventSource::new(reader.clone(), config(), None);
        source.poll_once().await.unwrap(); // covers 1..=8, remembers 3 and 8

        reader.reorg_from(5);
        reader.mine_to(12);

        let events = source.poll_once().await.unwrap();
        assert!(events.contains(&SourceEvent::Reorg {
            chain: Chain::A,
            below: 4
        }));
        assert!(events.iter().any(|e| matches!(
            e,
            SourceEvent::Checkpoint { cursor, .. } if cursor.number == 3
        )));
        assert_eq!(source.cursor().unwrap().number, 10);
    }

    #[tokio::test]
    async fn test_run_survives_transient_errors() {
        let reader = MockChainReader::new(Chain::B);
        reader.mine_to(10);
        reader.add_withdrawal(4, 1);
        reader.fail_next(3);

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let source = EventSource::new(reader.clone(), config(), None);
        let handle = tokio::spawn(source.run(tx, shutdown_rx));

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            first,
            EngineEvent::Source(SourceEvent::Observed(ref e)) if e.block.number == 4
        ));
        assert!(reader.reconnects() >= 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
