use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use crate::rpc_fallback::parse_rpc_urls;
use crate::tokens::TokenMapping;
use crate::types::Chain;
use crate::writers::{RetryConfig, DEFAULT_ALREADY_APPLIED_PATTERNS};

/// Coordinator configuration
#[derive(Clone)]
pub struct Config {
    pub chain_a: ChainConfig,
    pub chain_b: ChainConfig,
    /// Postgres URL; the ledger stays in memory when unset
    pub database_url: Option<String>,
    /// Relayer key used on both chains
    pub private_key: String,
    pub challenge_period: Duration,
    /// Extra `a:b` token pairs on top of the deployment records
    pub token_mappings: Vec<(Address, Address)>,
    pub relayer: RelayerConfig,
    pub api: ApiConfig,
}

/// Per-chain connection settings
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain: Chain,
    /// Primary URL first, then fallbacks
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub bridge_address: Address,
    pub finality_blocks: u64,
    pub start_block: Option<u64>,
    pub deployment: Option<Deployment>,
}

#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub max_block_range: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub max_in_flight_per_signer: usize,
    pub already_applied_patterns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

/// `l1-deployment.json` as written by the chain A deploy script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L1Deployment {
    #[serde(default)]
    pub network: String,
    pub l1_bridge: Address,
    pub l1_token: Address,
    pub deployer: Option<Address>,
}

/// `l2-deployment.json` as written by the chain B deploy script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L2Deployment {
    #[serde(default)]
    pub network: String,
    pub l2_bridge: Address,
    pub l2_token: Address,
    pub l1_token_mapped: Address,
    pub deployer: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deployment {
    L1(L1Deployment),
    L2(L2Deployment),
}

impl Deployment {
    /// Read the deployment record for `chain` from disk
    pub fn load(chain: Chain, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read deployment file {}", path.display()))?;
        Self::parse(chain, &raw)
            .wrap_err_with(|| format!("Invalid deployment file {}", path.display()))
    }

    pub fn parse(chain: Chain, raw: &str) -> Result<Self> {
        Ok(match chain {
            Chain::A => Deployment::L1(serde_json::from_str(raw)?),
            Chain::B => Deployment::L2(serde_json::from_str(raw)?),
        })
    }

    pub fn bridge(&self) -> Address {
        match self {
            Deployment::L1(d) => d.l1_bridge,
            Deployment::L2(d) => d.l2_bridge,
        }
    }

    pub fn deployer(&self) -> Option<Address> {
        match self {
            Deployment::L1(d) => d.deployer,
            Deployment::L2(d) => d.deployer,
        }
    }

    /// Token pair recorded by the chain B deployment
    pub fn token_pair(&self) -> Option<(Address, Address)> {
        match self {
            Deployment::L1(_) => None,
            Deployment::L2(d) => Some((d.l1_token_mapped, d.l2_token)),
        }
    }
}

// Custom Debug to avoid leaking secrets in logs
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("chain_a", &self.chain_a)
            .field("chain_b", &self.chain_b)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<redacted>"),
            )
            .field("private_key", &"<redacted>")
            .field("challenge_period", &self.challenge_period)
            .field("token_mappings", &self.token_mappings)
            .field("relayer", &self.relayer)
            .field("api", &self.api)
            .finish()
    }
}

fn default_finality_blocks() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2000
}

fn default_max_in_flight() -> usize {
    1
}

fn default_api_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    9092
}

fn optional<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment and .env file
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file, then the environment
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path).ok();
        }
        Self::load_from_env()
    }

    pub fn load_from_env() -> Result<Self> {
        let chain_a = load_chain(Chain::A)?;
        let chain_b = load_chain(Chain::B)?;

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        let private_key = env::var("PRIVATE_KEY")
            .map_err(|_| eyre!("PRIVATE_KEY environment variable is required"))?;

        let challenge_secs: u64 = env::var("CHALLENGE_PERIOD_SECS")
            .map_err(|_| eyre!("CHALLENGE_PERIOD_SECS environment variable is required"))?
            .parse()
            .wrap_err("CHALLENGE_PERIOD_SECS must be a whole number of seconds")?;

        let token_mappings = match env::var("TOKEN_MAPPINGS") {
            Ok(raw) => parse_token_mappings(&raw)?,
            Err(_) => Vec::new(),
        };

        let already_applied_patterns = env::var("ALREADY_APPLIED_PATTERNS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|patterns| !patterns.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_ALREADY_APPLIED_PATTERNS
                    .iter()
                    .map(|p| p.to_string())
                    .collect()
            });

        let relayer = RelayerConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS").unwrap_or(default_poll_interval()),
            max_block_range: optional("MAX_BLOCK_RANGE").unwrap_or(default_max_block_range()),
            retry_attempts: optional("RETRY_ATTEMPTS").unwrap_or(default_retry_attempts()),
            retry_delay_ms: optional("RETRY_DELAY_MS").unwrap_or(default_retry_delay()),
            max_in_flight_per_signer: optional("MAX_IN_FLIGHT_PER_SIGNER")
                .unwrap_or(default_max_in_flight()),
            already_applied_patterns,
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_api_bind_address()),
            port: optional("API_PORT").unwrap_or(default_api_port()),
        };

        Ok(Config {
            chain_a,
            chain_b,
            database_url,
            private_key,
            challenge_period: Duration::from_secs(challenge_secs),
            token_mappings,
            relayer,
            api,
        })
    }

    pub fn chain(&self, chain: Chain) -> &ChainConfig {
        match chain {
            Chain::A => &self.chain_a,
            Chain::B => &self.chain_b,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.relayer.poll_interval_ms)
    }

    /// Backoff used by both the event sources and the actuators
    pub fn retry_config(&self) -> RetryConfig {
        let initial = Duration::from_millis(self.relayer.retry_delay_ms);
        RetryConfig {
            max_retries: self.relayer.retry_attempts,
            initial_backoff: initial,
            max_backoff: initial.saturating_mul(30),
            ..RetryConfig::default()
        }
    }

    /// Build the immutable token mapping from deployment records and `TOKEN_MAPPINGS`
    pub fn build_token_mapping(&self) -> Result<TokenMapping> {
        let mut mapping = TokenMapping::new();
        let deployed = [&self.chain_a, &self.chain_b]
            .into_iter()
            .filter_map(|c| c.deployment.as_ref().and_then(Deployment::token_pair));

        for (a, b) in deployed.chain(self.token_mappings.iter().copied()) {
            mapping
                .insert(a, b)
                .wrap_err("Conflicting token mapping in configuration")?;
        }
        Ok(mapping)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.private_key.starts_with("0x") || self.private_key.len() != 66 {
            return Err(eyre!("Invalid private key format"));
        }

        if self.challenge_period.is_zero() {
            return Err(eyre!("CHALLENGE_PERIOD_SECS must be greater than zero"));
        }

        for chain in [&self.chain_a, &self.chain_b] {
            if chain.rpc_urls.is_empty() {
                return Err(eyre!("chain {} has no RPC URL", chain.chain));
            }
            if chain.bridge_address == Address::ZERO {
                return Err(eyre!("chain {} bridge address is zero", chain.chain));
            }
            if let Some(ref deployment) = chain.deployment {
                if deployment.bridge() != chain.bridge_address {
                    return Err(eyre!(
                        "chain {} bridge address {} disagrees with deployment record {}",
                        chain.chain,
                        chain.bridge_address,
                        deployment.bridge()
                    ));
                }
            }
        }

        if self.chain_a.chain_id == self.chain_b.chain_id {
            return Err(eyre!(
                "CHAIN_A_ID and CHAIN_B_ID are both {}; the two sides must be distinct chains",
                self.chain_a.chain_id
            ));
        }

        if self.relayer.max_block_range == 0 {
            return Err(eyre!("MAX_BLOCK_RANGE must be greater than zero"));
        }
        if self.relayer.max_in_flight_per_signer == 0 {
            return Err(eyre!("MAX_IN_FLIGHT_PER_SIGNER must be greater than zero"));
        }

        self.build_token_mapping()?;

        Ok(())
    }
}

fn var_name(chain: Chain, suffix: &str) -> String {
    format!("CHAIN_{}_{}", chain.as_str().to_uppercase(), suffix)
}

fn load_chain(chain: Chain) -> Result<ChainConfig> {
    let rpc_var = var_name(chain, "RPC_URL");
    let rpc_urls = parse_rpc_urls(
        &env::var(&rpc_var).map_err(|_| eyre!("{} environment variable is required", rpc_var))?,
    );

    let id_var = var_name(chain, "ID");
    let chain_id = env::var(&id_var)
        .map_err(|_| eyre!("{} environment variable is required", id_var))?
        .parse()
        .wrap_err_with(|| format!("{} must be a number", id_var))?;

    let deployment = match env::var(var_name(chain, "DEPLOYMENT")) {
        Ok(path) => Some(Deployment::load(chain, &PathBuf::from(path))?),
        Err(_) => None,
    };

    let address_var = var_name(chain, "BRIDGE_ADDRESS");
    let bridge_address = match (env::var(&address_var), &deployment) {
        (Ok(raw), _) => raw
            .parse()
            .wrap_err_with(|| format!("{} is not a valid address", address_var))?,
        (Err(_), Some(deployment)) => deployment.bridge(),
        (Err(_), None) => {
            return Err(eyre!(
                "{} or {} is required",
                address_var,
                var_name(chain, "DEPLOYMENT")
            ))
        }
    };

    Ok(ChainConfig {
        chain,
        rpc_urls,
        chain_id,
        bridge_address,
        finality_blocks: optional(&var_name(chain, "FINALITY_BLOCKS"))
            .unwrap_or(default_finality_blocks()),
        start_block: optional(&var_name(chain, "START_BLOCK")),
        deployment,
    })
}

/// Parse `0xA:0xB,0xC:0xD` into token pairs
pub fn parse_token_mappings(raw: &str) -> Result<Vec<(Address, Address)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (a, b) = entry
                .split_once(':')
                .ok_or_else(|| eyre!("token mapping '{}' must be <a_token>:<b_token>", entry))?;
            let a: Address = a
                .trim()
                .parse()
                .wrap_err_with(|| format!("invalid chain A token in '{}'", entry))?;
            let b: Address = b
                .trim()
                .parse()
                .wrap_err_with(|| format!("invalid chain B token in '{}'", entry))?;
            Ok((a, b))
        })
        .collect()
}
