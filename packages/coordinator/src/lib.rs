//! Bridge relay coordinator
//!
//! Watches the bridge contracts of two EVM chains and relays each transfer to
//! the other side exactly once: deposits on chain A are processed on chain B,
//! and withdrawals initiated on chain B are finalized on chain A after the
//! challenge period.

pub mod api;
pub mod challenge;
pub mod config;
pub mod contracts;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod hash;
pub mod ledger;
pub mod metrics;
pub mod rpc_fallback;
pub mod tokens;
pub mod types;
pub mod watchers;
pub mod writers;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use engine::{EngineHandle, EngineSettings, RelayEngine};
pub use error::RelayError;
pub use ledger::TransferLedger;
pub use types::{Chain, Direction, Transfer, TransferHash, TransferState};
