//! Core types for cross-chain transfers
//!
//! A [`Transfer`] is the unit of cross-chain work. Its lifecycle is tracked by
//! [`TransferState`]; the set of legal forward moves lives in
//! [`TransferState::can_advance_to`] so the ledger and the engine agree on it.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Content-derived idempotency key of a transfer
pub type TransferHash = B256;

/// One of the two bridged ledgers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Origin of deposits, destination of withdrawals (L1)
    A,
    /// Destination of deposits, origin of withdrawals (L2)
    B,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::A => "a",
            Chain::B => "b",
        }
    }

    pub fn other(&self) -> Chain {
        match self {
            Chain::A => Chain::B,
            Chain::B => Chain::A,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Chain {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "a" => Ok(Chain::A),
            "b" => Ok(Chain::B),
            other => Err(eyre::eyre!("unknown chain: {}", other)),
        }
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    DepositAtoB,
    WithdrawalBtoA,
}

impl Direction {
    /// Chain where value was locked and the event was emitted
    pub fn origin(&self) -> Chain {
        match self {
            Direction::DepositAtoB => Chain::A,
            Direction::WithdrawalBtoA => Chain::B,
        }
    }

    /// Chain where the mint/release is applied
    pub fn destination(&self) -> Chain {
        self.origin().other()
    }

    /// Discriminant used in the transfer hash preimage
    pub fn as_u8(&self) -> u8 {
        match self {
            Direction::DepositAtoB => 0,
            Direction::WithdrawalBtoA => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::DepositAtoB => "deposit",
            Direction::WithdrawalBtoA => "withdrawal",
        }
    }

    pub fn is_withdrawal(&self) -> bool {
        matches!(self, Direction::WithdrawalBtoA)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Direction::DepositAtoB),
            "withdrawal" => Ok(Direction::WithdrawalBtoA),
            other => Err(eyre::eyre!("unknown direction: {}", other)),
        }
    }
}

/// A confirmed block on one chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: B256,
}

impl BlockRef {
    pub fn new(number: u64, hash: B256) -> Self {
        Self { number, hash }
    }
}

/// Lifecycle state of a transfer
///
/// `Reorged` is the reversible pre-confirmation state a transfer is put back
/// into when its origin block is orphaned; re-observing the event moves it
/// back to `Observed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Reorged,
    Observed,
    Validated,
    AwaitingChallenge,
    Actuating,
    Applied,
    Finalized,
    Failed,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Reorged => "reorged",
            TransferState::Observed => "observed",
            TransferState::Validated => "validated",
            TransferState::AwaitingChallenge => "awaiting_challenge",
            TransferState::Actuating => "actuating",
            TransferState::Applied => "applied",
            TransferState::Finalized => "finalized",
            TransferState::Failed => "failed",
        }
    }

    /// Forward edges of the state machine.
    ///
    /// Operator retry (`Failed → Validated`) and reorg rollback are explicit
    /// ledger paths and deliberately absent here.
    pub fn can_advance_to(&self, to: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, to),
            (Reorged, Observed)
                | (Observed, Validated)
                | (Observed, Failed)
                | (Validated, AwaitingChallenge)
                | (Validated, Actuating)
                | (Validated, Failed)
                | (AwaitingChallenge, Actuating)
                | (AwaitingChallenge, Failed)
                | (Actuating, Applied)
                | (Actuating, Failed)
                | (Applied, Finalized)
                | (Applied, Failed)
        )
    }

    /// True once a destination-side call may have been issued
    pub fn is_actuated(&self) -> bool {
        matches!(
            self,
            TransferState::Actuating | TransferState::Applied | TransferState::Finalized
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "reorged" => TransferState::Reorged,
            "observed" => TransferState::Observed,
            "validated" => TransferState::Validated,
            "awaiting_challenge" => TransferState::AwaitingChallenge,
            "actuating" => TransferState::Actuating,
            "applied" => TransferState::Applied,
            "finalized" => TransferState::Finalized,
            "failed" => TransferState::Failed,
            other => return Err(eyre::eyre!("unknown transfer state: {}", other)),
        })
    }
}

/// Why a transfer ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    UnsupportedToken,
    InvalidAmount,
    /// Withdrawal names a destination token that disagrees with the mapping
    TokenMismatch,
    /// The origin chain's hash differs from the canonical derivation
    HashMismatch,
    /// A fraud/cancellation signal arrived before the challenge deadline
    Contested,
    /// Destination call reverted for a business reason
    OnChainRevert(String),
}

impl FailureReason {
    /// Whether an operator retry may re-attempt the transfer
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Contested | FailureReason::HashMismatch)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnsupportedToken => write!(f, "UnsupportedToken"),
            FailureReason::InvalidAmount => write!(f, "InvalidAmount"),
            FailureReason::TokenMismatch => write!(f, "TokenMismatch"),
            FailureReason::HashMismatch => write!(f, "HashMismatch"),
            FailureReason::Contested => write!(f, "Contested"),
            FailureReason::OnChainRevert(msg) => write!(f, "OnChainRevert: {}", msg),
        }
    }
}

/// Operator-review flag; a flagged transfer is excluded from automatic processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ReviewFlag {
    /// Origin block was orphaned after the destination call was issued
    ReorgedAfterActuation { below: u64 },
    /// Destination effect and ledger disagree; needs manual reconciliation
    Irrecoverable(String),
}

impl fmt::Display for ReviewFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewFlag::ReorgedAfterActuation { below } => {
                write!(f, "origin reorg below block {} after actuation", below)
            }
            ReviewFlag::Irrecoverable(msg) => write!(f, "irrecoverable: {}", msg),
        }
    }
}

/// The unit of cross-chain work, owned by the transfer ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_hash: TransferHash,
    pub direction: Direction,
    pub user: Address,
    pub origin_token: Address,
    /// Resolved once from the token mapping during validation
    pub destination_token: Option<Address>,
    /// Destination token named by the origin event (withdrawals only)
    pub claimed_destination_token: Option<Address>,
    pub amount: U256,
    pub origin_nonce: U256,
    /// Hash emitted by the origin contract
    pub origin_hash: B256,
    pub state: TransferState,
    pub origin_confirmed_at: u64,
    pub origin_block_hash: B256,
    pub destination_tx: Option<B256>,
    pub destination_applied_at: Option<u64>,
    pub challenge_deadline: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    pub review: Option<ReviewFlag>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn is_flagged(&self) -> bool {
        self.review.is_some()
    }
}
