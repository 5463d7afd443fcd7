use alloy::primitives::{Address, B256, U256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use eyre::{bail, eyre, Result, WrapErr};
use serde::Deserialize;
use tracing::{info, warn};

use super::ChainReader;
use crate::config::ChainConfig;
use crate::contracts::{L1Bridge, L2Bridge};
use crate::events::{ChainEvent, DepositObserved, ObservedEvent, WithdrawalObserved};
use crate::hash::keccak256;
use crate::rpc_fallback::FallbackProviders;
use crate::types::{BlockRef, Chain};

/// Withdrawal event of bridges that do not emit the origin nonce; transfer
/// hashes cannot be derived from it
const NONCELESS_WITHDRAWAL: &str = "WithdrawalInitiated(address,address,address,uint256,bytes32)";

/// Reject a bridge whose recent logs use an event layout this reader cannot
/// decode into transfers
pub fn check_event_layout(chain: Chain, topics: impl IntoIterator<Item = B256>) -> Result<()> {
    if chain != Chain::B {
        return Ok(());
    }
    let nonceless = B256::from(keccak256(NONCELESS_WITHDRAWAL.as_bytes()));
    if topics.into_iter().any(|topic| topic == nonceless) {
        bail!(
            "chain {} bridge emits {} without the origin nonce; expected {}",
            chain,
            NONCELESS_WITHDRAWAL,
            L2Bridge::WithdrawalInitiated::SIGNATURE
        );
    }
    Ok(())
}

/// Result of the startup connectivity check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainProbe {
    pub chain_id: u64,
    pub latest_block: u64,
    pub relayer_balance: Option<U256>,
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    hash: B256,
}

/// EVM reader for the bridge event of one chain
///
/// Chain A is scanned for `Deposit`, chain B for `WithdrawalInitiated`.
pub struct EvmChainReader {
    chain: Chain,
    chain_id: u64,
    bridge_address: Address,
    max_block_range: u64,
    providers: FallbackProviders,
}

impl EvmChainReader {
    pub fn new(config: &ChainConfig, max_block_range: u64) -> Result<Self> {
        let providers = FallbackProviders::new(config.rpc_urls.clone())?;
        Ok(Self {
            chain: config.chain,
            chain_id: config.chain_id,
            bridge_address: config.bridge_address,
            max_block_range: max_block_range.max(1),
            providers,
        })
    }

    fn event_topic(&self) -> B256 {
        match self.chain {
            Chain::A => L1Bridge::Deposit::SIGNATURE_HASH,
            Chain::B => L2Bridge::WithdrawalInitiated::SIGNATURE_HASH,
        }
    }

    /// Check the node is reachable, serves the configured chain and that the
    /// bridge's recent events have the layout this reader decodes
    pub async fn probe(&self, relayer: Option<Address>) -> Result<ChainProbe> {
        let provider = self.providers.current();
        let chain_id = provider
            .get_chain_id()
            .await
            .wrap_err_with(|| format!("Failed to get chain id for chain {}", self.chain))?;
        if chain_id != self.chain_id {
            return Err(eyre!(
                "chain {} RPC reports chain id {}, configured {}",
                self.chain,
                chain_id,
                self.chain_id
            ));
        }

        let latest_block = provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")?;

        let code = provider
            .get_code_at(self.bridge_address)
            .await
            .wrap_err("Failed to get bridge code")?;
        if code.is_empty() {
            bail!(
                "no contract at chain {} bridge address {}",
                self.chain,
                self.bridge_address
            );
        }

        let recent = Filter::new()
            .address(self.bridge_address)
            .from_block(latest_block.saturating_sub(self.max_block_range - 1))
            .to_block(latest_block);
        let logs = provider
            .get_logs(&recent)
            .await
            .wrap_err("Failed to get recent bridge logs")?;
        check_event_layout(
            self.chain,
            logs.iter().filter_map(|log| log.topics().first().copied()),
        )?;

        let relayer_balance = match relayer {
            Some(address) => Some(
                provider
                    .get_balance(address)
                    .await
                    .wrap_err("Failed to get relayer balance")?,
            ),
            None => None,
        };

        info!(
            chain = %self.chain,
            chain_id,
            latest_block,
            rpc_url = %self.providers.current_url(),
            "Connected to chain"
        );

        if relayer_balance == Some(U256::ZERO) {
            warn!(
                chain = %self.chain,
                relayer = ?relayer,
                "Relayer account has zero balance; destination calls will fail"
            );
        }

        Ok(ChainProbe {
            chain_id,
            latest_block,
            relayer_balance,
        })
    }

    /// Decode every live log of a range; one undecodable log fails the whole
    /// range so the source retries it instead of moving past
    fn parse_logs(&self, logs: &[Log]) -> Result<Vec<ObservedEvent>> {
        logs.iter()
            .filter(|log| !log.removed)
            .map(|log| {
                self.parse_log(log).wrap_err_with(|| {
                    format!(
                        "Failed to parse bridge log {:?}:{:?}",
                        log.transaction_hash, log.log_index
                    )
                })
            })
            .collect()
    }

    fn parse_log(&self, log: &Log) -> Result<ObservedEvent> {
        let block_number = log
            .block_number
            .ok_or_else(|| eyre!("Missing block number"))?;
        let block_hash = log.block_hash.ok_or_else(|| eyre!("Missing block hash"))?;
        let log_index = log.log_index.ok_or_else(|| eyre!("Missing log index"))?;

        let event = match self.chain {
            Chain::A => {
                let decoded = log
                    .log_decode::<L1Bridge::Deposit>()
                    .wrap_err("Failed to decode Deposit")?;
                let data = decoded.inner.data;
                ChainEvent::Deposit(DepositObserved {
                    user: data.user,
                    token: data.token,
                    amount: data.amount,
                    nonce: data.nonce,
                    deposit_hash: data.depositHash,
                })
            }
            Chain::B => {
                let decoded = log
                    .log_decode::<L2Bridge::WithdrawalInitiated>()
                    .wrap_err("Failed to decode WithdrawalInitiated")?;
                let data = decoded.inner.data;
                ChainEvent::WithdrawalInitiated(WithdrawalObserved {
                    user: data.user,
                    l2_token: data.l2Token,
                    l1_token: data.l1Token,
                    amount: data.amount,
                    nonce: data.nonce,
                    withdrawal_hash: data.withdrawalHash,
                })
            }
        };

        Ok(ObservedEvent {
            chain: self.chain,
            block: BlockRef::new(block_number, block_hash),
            log_index,
            event,
        })
    }
}

#[async_trait]
impl ChainReader for EvmChainReader {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn head(&self) -> Result<u64> {
        self.providers
            .current()
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>> {
        let header: Option<RpcBlockHeader> = self
            .providers
            .current()
            .raw_request(
                "eth_getBlockByNumber".into(),
                (format!("0x{:x}", number), false),
            )
            .await
            .wrap_err_with(|| format!("Failed to get block {}", number))?;
        Ok(header.map(|h| h.hash))
    }

    async fn events(&self, from: u64, to: u64) -> Result<Vec<ObservedEvent>> {
        let mut events = Vec::new();
        let mut current_from = from;

        // Chunk into manageable ranges
        while current_from <= to {
            let current_to = std::cmp::min(current_from + self.max_block_range - 1, to);

            let filter = Filter::new()
                .address(self.bridge_address)
                .event_signature(self.event_topic())
                .from_block(current_from)
                .to_block(current_to);

            let logs = self
                .providers
                .current()
                .get_logs(&filter)
                .await
                .wrap_err_with(|| {
                    format!(
                        "Failed to get logs from block {} to {}",
                        current_from, current_to
                    )
                })?;

            events.extend(self.parse_logs(&logs)?);

            current_from = current_to + 1;
        }

        Ok(events)
    }

    async fn reconnect(&self) {
        let url = self.providers.rotate();
        info!(chain = %self.chain, rpc_url = %url, "Switched to fallback RPC");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deposit_event, withdrawal_event};
    use alloy::primitives::{address, Bytes, LogData};

    const BRIDGE: Address = address!("5FbDB2315678afecb367f032d93F642f64180aa3");

    fn reader(chain: Chain) -> EvmChainReader {
        let config = ChainConfig {
            chain,
            rpc_urls: vec!["http://localhost:8545".to_string()],
            chain_id: 31337,
            bridge_address: BRIDGE,
            finality_blocks: 1,
            start_block: None,
            deployment: None,
        };
        EvmChainReader::new(&config, 100).unwrap()
    }

    fn rpc_log(data: LogData, block: u64, log_index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: BRIDGE,
                data,
            },
            block_hash: Some(B256::repeat_byte(block as u8)),
            block_number: Some(block),
            block_timestamp: None,
            transaction_hash: Some(B256::repeat_byte(0xaa)),
            transaction_index: Some(0),
            log_index: Some(log_index),
            removed: false,
        }
    }

    fn deposit_log(nonce: u64, block: u64, log_index: u64) -> Log {
        let d = deposit_event(nonce);
        let event = L1Bridge::Deposit {
            user: d.user,
            token: d.token,
            amount: d.amount,
            nonce: d.nonce,
            depositHash: d.deposit_hash,
        };
        rpc_log(event.encode_log_data(), block, log_index)
    }

    #[test]
    fn test_parse_deposit_log() {
        let events = reader(Chain::A).parse_logs(&[deposit_log(7, 12, 3)]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block.number, 12);
        assert_eq!(events[0].log_index, 3);
        assert_eq!(events[0].event, ChainEvent::Deposit(deposit_event(7)));
    }

    #[test]
    fn test_undecodable_log_fails_the_range() {
        // Right topic0, but the indexed fields and data are missing
        let truncated = LogData::new_unchecked(
            vec![L1Bridge::Deposit::SIGNATURE_HASH],
            Bytes::new(),
        );
        let logs = vec![
            deposit_log(7, 12, 0),
            rpc_log(truncated, 12, 1),
            deposit_log(8, 13, 0),
        ];
        assert!(reader(Chain::A).parse_logs(&logs).is_err());
    }

    #[test]
    fn test_removed_logs_are_skipped() {
        let mut removed = deposit_log(7, 12, 0);
        removed.removed = true;
        let events = reader(Chain::A)
            .parse_logs(&[removed, deposit_log(8, 13, 0)])
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, ChainEvent::Deposit(deposit_event(8)));
    }

    #[test]
    fn test_parse_withdrawal_log() {
        let w = withdrawal_event(1);
        let event = L2Bridge::WithdrawalInitiated {
            user: w.user,
            l2Token: w.l2_token,
            l1Token: w.l1_token,
            amount: w.amount,
            nonce: w.nonce,
            withdrawalHash: w.withdrawal_hash,
        };
        let events = reader(Chain::B)
            .parse_logs(&[rpc_log(event.encode_log_data(), 20, 0)])
            .unwrap();
        assert_eq!(events[0].chain, Chain::B);
        assert_eq!(events[0].event, ChainEvent::WithdrawalInitiated(w));
    }

    #[test]
    fn test_nonceless_withdrawal_bridge_is_rejected() {
        let nonceless = B256::from(keccak256(NONCELESS_WITHDRAWAL.as_bytes()));
        assert_ne!(nonceless, L2Bridge::WithdrawalInitiated::SIGNATURE_HASH);

        let err = check_event_layout(Chain::B, [nonceless]).unwrap_err();
        assert!(err.to_string().contains("without the origin nonce"));

        check_event_layout(Chain::B, [L2Bridge::WithdrawalInitiated::SIGNATURE_HASH]).unwrap();
        check_event_layout(Chain::B, []).unwrap();
        check_event_layout(Chain::A, [L1Bridge::Deposit::SIGNATURE_HASH]).unwrap();
    }
}
