//! Event types flowing from the chain sources and the operator into the engine
//!
//! Everything the engine reacts to arrives as one [`EngineEvent`] over a
//! single channel.

use alloy::primitives::{Address, B256, U256};
use tokio::sync::oneshot;

use crate::error::RelayError;
use crate::types::{BlockRef, Chain, Transfer, TransferHash};

/// `Deposit(user, token, amount, nonce, depositHash)` on chain A
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositObserved {
    pub user: Address,
    pub token: Address,
    pub amount: U256,
    pub nonce: U256,
    pub deposit_hash: B256,
}

/// `WithdrawalInitiated(user, l2Token, l1Token, amount, nonce, withdrawalHash)` on chain B
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalObserved {
    pub user: Address,
    pub l2_token: Address,
    pub l1_token: Address,
    pub amount: U256,
    pub nonce: U256,
    pub withdrawal_hash: B256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Deposit(DepositObserved),
    WithdrawalInitiated(WithdrawalObserved),
}

/// A confirmed event together with where it was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub chain: Chain,
    pub block: BlockRef,
    pub log_index: u64,
    pub event: ChainEvent,
}

/// Output of an event source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Observed(ObservedEvent),
    /// Blocks at or above `below` are no longer canonical
    Reorg { chain: Chain, below: u64 },
    /// Everything up to and including `cursor` has been delivered
    Checkpoint { chain: Chain, cursor: BlockRef },
}

impl SourceEvent {
    pub fn chain(&self) -> Chain {
        match self {
            SourceEvent::Observed(e) => e.chain,
            SourceEvent::Reorg { chain, .. } => *chain,
            SourceEvent::Checkpoint { chain, .. } => *chain,
        }
    }
}

pub type Reply<T> = oneshot::Sender<Result<T, RelayError>>;

/// Operator commands
#[derive(Debug)]
pub enum Command {
    Retry {
        transfer_hash: TransferHash,
        reply: Reply<Transfer>,
    },
    Contest {
        transfer_hash: TransferHash,
        reply: Reply<Transfer>,
    },
    Resolve {
        transfer_hash: TransferHash,
        reply: Reply<Transfer>,
    },
}

/// The engine's single input type
#[derive(Debug)]
pub enum EngineEvent {
    Source(SourceEvent),
    Command(Command),
}

impl From<SourceEvent> for EngineEvent {
    fn from(event: SourceEvent) -> Self {
        EngineEvent::Source(event)
    }
}

impl From<Command> for EngineEvent {
    fn from(command: Command) -> Self {
        EngineEvent::Command(command)
    }
}
