//! Durable backing for the transfer ledger

use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::types::{BlockRef, Chain, Transfer, TransferHash};

/// Persistence seam of the ledger.
///
/// The ledger writes a record here before it becomes visible in memory, so a
/// successful `save_transfer` is the commit point of every transition.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_transfers(&self) -> Result<Vec<Transfer>>;

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()>;

    async fn save_transfers(&self, transfers: &[Transfer]) -> Result<()> {
        for transfer in transfers {
            self.save_transfer(transfer).await?;
        }
        Ok(())
    }

    async fn load_cursor(&self, chain: Chain) -> Result<Option<BlockRef>>;

    async fn save_cursor(&self, chain: Chain, cursor: BlockRef) -> Result<()>;
}

/// Process-local store for tests and database-less runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    transfers: Mutex<HashMap<TransferHash, Transfer>>,
    cursors: Mutex<HashMap<Chain, BlockRef>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, simulating an unavailable database
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn transfer(&self, hash: &TransferHash) -> Option<Transfer> {
        self.transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(eyre!("memory store is failing writes"));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn load_transfers(&self) -> Result<Vec<Transfer>> {
        Ok(self
            .transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()> {
        self.check_writable()?;
        self.transfers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transfer.transfer_hash, transfer.clone());
        Ok(())
    }

    async fn load_cursor(&self, chain: Chain) -> Result<Option<BlockRef>> {
        Ok(self
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&chain)
            .copied())
    }

    async fn save_cursor(&self, chain: Chain, cursor: BlockRef) -> Result<()> {
        self.check_writable()?;
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chain, cursor);
        Ok(())
    }
}
