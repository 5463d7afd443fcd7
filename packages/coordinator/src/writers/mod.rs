//! Destination-side actuation
//!
//! An [`Actuator`] submits the one state-changing call a transfer needs on its
//! destination chain and waits for it to become final:
//!
//! - chain B: `processDeposit(user, l1Token, amount, depositHash)`
//! - chain A: `finalizeWithdrawal(user, l1Token, amount, withdrawalHash)`
//!
//! Both contracts reject a hash they have already applied, and both emit a
//! marker event indexed by the hash, which is what `find_applied` looks for
//! during reconciliation.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub mod evm;
pub mod retry;

pub use evm::EvmActuator;
pub use retry::{
    classify_error, ErrorClass, ErrorClassifier, RetryConfig, RetryingActuator,
    DEFAULT_ALREADY_APPLIED_PATTERNS,
};

use crate::types::{Chain, Direction, Transfer};

/// A destination-chain call for one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ProcessDeposit {
        user: Address,
        l1_token: Address,
        amount: U256,
        deposit_hash: B256,
    },
    FinalizeWithdrawal {
        user: Address,
        l1_token: Address,
        amount: U256,
        withdrawal_hash: B256,
    },
}

impl Action {
    /// Build the destination call for a validated transfer.
    ///
    /// Returns `None` for a withdrawal whose destination token was never
    /// resolved.
    pub fn for_transfer(transfer: &Transfer) -> Option<Action> {
        match transfer.direction {
            Direction::DepositAtoB => Some(Action::ProcessDeposit {
                user: transfer.user,
                l1_token: transfer.origin_token,
                amount: transfer.amount,
                deposit_hash: transfer.transfer_hash,
            }),
            Direction::WithdrawalBtoA => Some(Action::FinalizeWithdrawal {
                user: transfer.user,
                l1_token: transfer.destination_token?,
                amount: transfer.amount,
                withdrawal_hash: transfer.transfer_hash,
            }),
        }
    }

    /// Chain the call is sent to
    pub fn chain(&self) -> Chain {
        match self {
            Action::ProcessDeposit { .. } => Chain::B,
            Action::FinalizeWithdrawal { .. } => Chain::A,
        }
    }

    pub fn transfer_hash(&self) -> B256 {
        match self {
            Action::ProcessDeposit { deposit_hash, .. } => *deposit_hash,
            Action::FinalizeWithdrawal {
                withdrawal_hash, ..
            } => *withdrawal_hash,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::ProcessDeposit { .. } => "processDeposit",
            Action::FinalizeWithdrawal { .. } => "finalizeWithdrawal",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) on chain {}", self.name(), self.transfer_hash(), self.chain())
    }
}

/// A submitted destination transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHandle {
    pub chain: Chain,
    pub tx_hash: B256,
    /// Known when the handle was recovered from an already mined transaction
    pub block_number: Option<u64>,
}

/// A destination transaction at the chain's confirmation depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub block_number: u64,
}

impl Receipt {
    pub fn handle(&self, chain: Chain) -> TxHandle {
        TxHandle {
            chain,
            tx_hash: self.tx_hash,
            block_number: Some(self.block_number),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ActuatorError {
    /// Infrastructure failure; the call may or may not have been sent
    #[error("transient: {0}")]
    Transient(String),

    /// The destination contract has already applied this hash
    #[error("already applied")]
    AlreadyApplied,

    /// The call was mined or simulated and reverted for a business reason
    #[error("reverted: {0}")]
    Reverted(String),

    /// A submitted transaction vanished from the chain
    #[error("transaction {0} dropped")]
    Dropped(B256),
}

impl ActuatorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ActuatorError::Transient(_))
    }
}

#[async_trait]
pub trait Actuator: Send + Sync {
    /// Chain this actuator submits to
    fn chain(&self) -> Chain;

    /// Send the call and return once it is accepted by the node
    async fn submit(&self, action: &Action) -> Result<TxHandle, ActuatorError>;

    /// Wait until the transaction reaches the chain's confirmation depth
    async fn await_finality(&self, handle: &TxHandle) -> Result<Receipt, ActuatorError>;

    /// Look for an applied marker for the action's hash on the destination
    async fn find_applied(&self, action: &Action) -> Result<Option<Receipt>, ActuatorError>;
}

/// One actuator per destination chain
#[derive(Clone)]
pub struct Actuators {
    chain_a: Arc<dyn Actuator>,
    chain_b: Arc<dyn Actuator>,
}

impl Actuators {
    pub fn new(chain_a: Arc<dyn Actuator>, chain_b: Arc<dyn Actuator>) -> Self {
        Self { chain_a, chain_b }
    }

    pub fn for_chain(&self, chain: Chain) -> &Arc<dyn Actuator> {
        match chain {
            Chain::A => &self.chain_a,
            Chain::B => &self.chain_b,
        }
    }
}

impl fmt::Debug for Actuators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actuators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_deposit, sample_withdrawal};

    #[test]
    fn test_deposit_action_targets_chain_b() {
        let transfer = sample_deposit();
        let action = Action::for_transfer(&transfer).unwrap();
        assert_eq!(action.chain(), Chain::B);
        assert_eq!(action.transfer_hash(), transfer.transfer_hash);
        assert!(matches!(action, Action::ProcessDeposit { l1_token, .. } if l1_token == transfer.origin_token));
    }

    #[test]
    fn test_withdrawal_action_needs_resolved_token() {
        let mut transfer = sample_withdrawal();
        transfer.destination_token = None;
        assert!(Action::for_transfer(&transfer).is_none());

        let l1 = Address::repeat_byte(0xaa);
        transfer.destination_token = Some(l1);
        let action = Action::for_transfer(&transfer).unwrap();
        assert_eq!(action.chain(), Chain::A);
        assert!(matches!(action, Action::FinalizeWithdrawal { l1_token, .. } if l1_token == l1));
    }
}
