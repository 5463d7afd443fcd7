//! EVM actuator - submits destination calls to the bridge contracts
//!
//! `processDeposit` goes to the `L2Bridge` on chain B and `finalizeWithdrawal`
//! to the `L1Bridge` on chain A. Submissions from one signer are capped by a
//! semaphore so nonces are assigned in order.

use std::sync::Arc;
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{Action, Actuator, ActuatorError, ErrorClassifier, Receipt, TxHandle};
use crate::config::ChainConfig;
use crate::contracts::{L1Bridge, L2Bridge};
use crate::rpc_fallback::FallbackProviders;
use crate::types::Chain;

/// Tuning for an [`EvmActuator`]
#[derive(Debug, Clone)]
pub struct ActuatorSettings {
    /// Concurrent submissions allowed from the signer
    pub max_in_flight: usize,
    pub classifier: ErrorClassifier,
    pub receipt_poll_interval: Duration,
    /// Consecutive polls without a receipt before a transaction counts as dropped
    pub max_receipt_misses: u32,
    /// How far back `find_applied` scans for marker events
    pub applied_lookback_blocks: u64,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            classifier: ErrorClassifier::default(),
            receipt_poll_interval: Duration::from_secs(2),
            max_receipt_misses: 150,
            applied_lookback_blocks: 50_000,
        }
    }
}

pub struct EvmActuator {
    chain: Chain,
    chain_id: u64,
    bridge_address: Address,
    confirmations: u64,
    max_block_range: u64,
    signer: PrivateKeySigner,
    providers: FallbackProviders,
    in_flight: Arc<Semaphore>,
    settings: ActuatorSettings,
}

impl EvmActuator {
    pub fn new(
        config: &ChainConfig,
        private_key: &str,
        max_block_range: u64,
        settings: ActuatorSettings,
    ) -> Result<Self> {
        let signer: PrivateKeySigner = private_key.parse().wrap_err("Invalid private key")?;
        let providers = FallbackProviders::new(config.rpc_urls.clone())?;

        info!(
            chain = %config.chain,
            chain_id = config.chain_id,
            relayer_address = %signer.address(),
            bridge_address = %config.bridge_address,
            max_in_flight = settings.max_in_flight,
            "EVM actuator initialized"
        );

        Ok(Self {
            chain: config.chain,
            chain_id: config.chain_id,
            bridge_address: config.bridge_address,
            confirmations: config.finality_blocks,
            max_block_range: max_block_range.max(1),
            signer,
            providers,
            in_flight: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            settings,
        })
    }

    /// Get the relayer's address
    pub fn relayer_address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn classify(&self, err: impl std::fmt::Display) -> ActuatorError {
        let error = self.settings.classifier.to_actuator_error(&err.to_string());
        if error.is_transient() {
            let url = self.providers.rotate();
            debug!(chain = %self.chain, rpc_url = %url, "Rotated RPC after transient error");
        }
        error
    }

    fn marker_topic(&self) -> B256 {
        match self.chain {
            Chain::A => L1Bridge::WithdrawalFinalized::SIGNATURE_HASH,
            Chain::B => L2Bridge::DepositProcessed::SIGNATURE_HASH,
        }
    }

    async fn send(&self, action: &Action) -> Result<B256, ActuatorError> {
        let url = self
            .providers
            .current_url()
            .parse()
            .map_err(|e| ActuatorError::Transient(format!("Invalid RPC URL: {}", e)))?;
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(url);

        let pending_tx = match action {
            Action::ProcessDeposit {
                user,
                l1_token,
                amount,
                deposit_hash,
            } => {
                if self.chain != Chain::B {
                    return Err(ActuatorError::Reverted(format!(
                        "processDeposit routed to chain {}",
                        self.chain
                    )));
                }
                let contract = L2Bridge::new(self.bridge_address, &provider);
                contract
                    .processDeposit(*user, *l1_token, *amount, *deposit_hash)
                    .send()
                    .await
                    .map_err(|e| self.classify(e))?
            }
            Action::FinalizeWithdrawal {
                user,
                l1_token,
                amount,
                withdrawal_hash,
            } => {
                if self.chain != Chain::A {
                    return Err(ActuatorError::Reverted(format!(
                        "finalizeWithdrawal routed to chain {}",
                        self.chain
                    )));
                }
                let contract = L1Bridge::new(self.bridge_address, &provider);
                contract
                    .finalizeWithdrawal(*user, *l1_token, *amount, *withdrawal_hash)
                    .send()
                    .await
                    .map_err(|e| self.classify(e))?
            }
        };

        Ok(*pending_tx.tx_hash())
    }
}

#[async_trait]
impl Actuator for EvmActuator {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn submit(&self, action: &Action) -> Result<TxHandle, ActuatorError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| ActuatorError::Transient("actuator is shutting down".to_string()))?;

        debug!(
            chain = %self.chain,
            transfer_hash = %action.transfer_hash(),
            call = action.name(),
            "Submitting destination call"
        );

        let tx_hash = self.send(action).await?;

        info!(
            chain = %self.chain,
            transfer_hash = %action.transfer_hash(),
            tx_hash = %tx_hash,
            "Destination transaction sent"
        );

        Ok(TxHandle {
            chain: self.chain,
            tx_hash,
            block_number: None,
        })
    }

    async fn await_finality(&self, handle: &TxHandle) -> Result<Receipt, ActuatorError> {
        let mut misses = 0u32;

        loop {
            let provider = self.providers.current();
            let receipt = provider
                .get_transaction_receipt(handle.tx_hash)
                .await
                .map_err(|e| self.classify(e))?;

            match receipt {
                Some(receipt) => {
                    misses = 0;
                    if !receipt.status() {
                        return Err(ActuatorError::Reverted(format!(
                            "transaction {} reverted",
                            handle.tx_hash
                        )));
                    }
                    let Some(block_number) = receipt.block_number else {
                        tokio::time::sleep(self.settings.receipt_poll_interval).await;
                        continue;
                    };
                    let head = provider
                        .get_block_number()
                        .await
                        .map_err(|e| self.classify(e))?;
                    if head >= block_number.saturating_add(self.confirmations) {
                        return Ok(Receipt {
                            tx_hash: handle.tx_hash,
                            block_number,
                        });
                    }
                    debug!(
                        chain = %self.chain,
                        tx_hash = %handle.tx_hash,
                        confirmations = head.saturating_sub(block_number),
                        required = self.confirmations,
                        "Waiting for destination confirmations"
                    );
                }
                None => {
                    misses += 1;
                    if misses > self.settings.max_receipt_misses {
                        warn!(
                            chain = %self.chain,
                            tx_hash = %handle.tx_hash,
                            misses,
                            "Destination transaction not found"
                        );
                        return Err(ActuatorError::Dropped(handle.tx_hash));
                    }
                }
            }

            tokio::time::sleep(self.settings.receipt_poll_interval).await;
        }
    }

    async fn find_applied(&self, action: &Action) -> Result<Option<Receipt>, ActuatorError> {
        let provider = self.providers.current();
        let head = provider
            .get_block_number()
            .await
            .map_err(|e| self.classify(e))?;
        let start = head.saturating_sub(self.settings.applied_lookback_blocks);

        // Newest chunk first: a recent apply is the common case
        let mut to = head;
        loop {
            let from = to.saturating_sub(self.max_block_range - 1).max(start);
            let filter = Filter::new()
                .address(self.bridge_address)
                .event_signature(self.marker_topic())
                .topic1(action.transfer_hash())
                .from_block(from)
                .to_block(to);

            let logs = provider
                .get_logs(&filter)
                .await
                .map_err(|e| self.classify(e))?;

            if let Some(log) = logs.first() {
                if let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number)
                {
                    return Ok(Some(Receipt {
                        tx_hash,
                        block_number,
                    }));
                }
            }

            if from <= start {
                return Ok(None);
            }
            to = from - 1;
        }
    }
}
