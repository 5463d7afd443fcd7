//! Error taxonomy of the relay engine
//!
//! Every failure the engine sees falls into one of a few classes, each with a
//! fixed consequence for the transfer it concerns:
//!
//! - `TransientInfra`: absorbed with backoff, transfer state unchanged
//! - `ProtocolViolation`: transfer moves to `Failed`, never retried automatically
//! - `OnChainRevert`: transfer moves to `Failed`, operator may retry
//! - `Irrecoverable`: transfer flagged, automatic processing halts for it

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::types::{FailureReason, TransferHash, TransferState};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(FailureReason),

    #[error("destination call reverted: {0}")]
    OnChainRevert(String),

    #[error("irrecoverable: {0}")]
    Irrecoverable(String),

    #[error("transfer {0} not found")]
    NotFound(TransferHash),

    #[error("transfer {hash} is {state}, expected failed")]
    NotRetryable {
        hash: TransferHash,
        state: TransferState,
    },

    #[error("transfer {hash} failed with {reason}, which cannot be retried")]
    RetryForbidden {
        hash: TransferHash,
        reason: FailureReason,
    },

    #[error("transfer {hash} is {state} and cannot be contested")]
    NotContestable {
        hash: TransferHash,
        state: TransferState,
    },

    #[error("transfer {0} is not flagged for review")]
    NotFlagged(TransferHash),

    #[error("transfer {0} is halted pending operator review")]
    Halted(TransferHash),

    #[error("engine is not running")]
    EngineStopped,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RelayError {
    /// Errors that leave the transfer where it was and are worth another try
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::TransientInfra(_))
    }

    /// The ledger could not persist a change; nothing was recorded
    pub fn is_store_failure(&self) -> bool {
        matches!(self, RelayError::Ledger(LedgerError::Store(_)))
    }

    /// Errors caused by the caller's request rather than the system
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::NotFound(_)
                | RelayError::NotRetryable { .. }
                | RelayError::RetryForbidden { .. }
                | RelayError::NotContestable { .. }
                | RelayError::NotFlagged(_)
                | RelayError::Halted(_)
        )
    }
}
