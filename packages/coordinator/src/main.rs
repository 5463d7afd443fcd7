use std::sync::Arc;

use eyre::WrapErr;
use tokio::sync::{mpsc, watch};

use bridge_coordinator::api::{self, AppState};
use bridge_coordinator::challenge::{ChallengeTimer, SystemClock};
use bridge_coordinator::config::{Config, Deployment};
use bridge_coordinator::db::PgStore;
use bridge_coordinator::engine::{EngineHandle, EngineSettings, RelayEngine};
use bridge_coordinator::ledger::{LedgerStore, MemoryStore, TransferLedger};
use bridge_coordinator::metrics;
use bridge_coordinator::types::Chain;
use bridge_coordinator::watchers::{ChainReader, EventSource, EvmChainReader, WatcherConfig};
use bridge_coordinator::writers::evm::ActuatorSettings;
use bridge_coordinator::writers::{
    Actuator, Actuators, ErrorClassifier, EvmActuator, RetryingActuator,
};

/// Capacity of the engine's event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge relay coordinator");

    let config = Config::load()?;
    config.validate()?;
    tracing::info!(
        chain_a_id = config.chain_a.chain_id,
        chain_b_id = config.chain_b.chain_id,
        challenge_period_secs = config.challenge_period.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(?config, "Full configuration");
    log_deployments(&config);

    let tokens = config.build_token_mapping()?;
    for (a, b) in tokens.pairs() {
        tracing::info!(chain_a_token = %a, chain_b_token = %b, "Token mapping");
    }
    if tokens.is_empty() {
        tracing::warn!("No token mappings configured; every transfer will be rejected");
    }

    let store: Arc<dyn LedgerStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            tracing::info!("Database connected, migrations complete");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; ledger will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    let ledger = Arc::new(TransferLedger::open(store).await?);

    // Destination side: one signer per chain, retried on transient errors
    let settings = ActuatorSettings {
        max_in_flight: config.relayer.max_in_flight_per_signer,
        classifier: ErrorClassifier::new(config.relayer.already_applied_patterns.clone()),
        ..ActuatorSettings::default()
    };
    let actuator_a = EvmActuator::new(
        &config.chain_a,
        &config.private_key,
        config.relayer.max_block_range,
        settings.clone(),
    )?;
    let actuator_b = EvmActuator::new(
        &config.chain_b,
        &config.private_key,
        config.relayer.max_block_range,
        settings,
    )?;
    let relayer = actuator_a.relayer_address();

    // Origin side: check connectivity before anything runs
    let reader_a = EvmChainReader::new(&config.chain_a, config.relayer.max_block_range)?;
    let reader_b = EvmChainReader::new(&config.chain_b, config.relayer.max_block_range)?;
    let probe_a = reader_a
        .probe(Some(relayer))
        .await
        .wrap_err("Chain A connectivity check failed")?;
    let probe_b = reader_b
        .probe(Some(relayer))
        .await
        .wrap_err("Chain B connectivity check failed")?;

    let actuators = Actuators::new(
        Arc::new(RetryingActuator::new(actuator_a, config.retry_config())) as Arc<dyn Actuator>,
        Arc::new(RetryingActuator::new(actuator_b, config.retry_config())) as Arc<dyn Actuator>,
    );

    let engine = RelayEngine::new(
        ledger.clone(),
        tokens,
        actuators,
        ChallengeTimer::new(config.challenge_period),
        Arc::new(SystemClock),
        EngineSettings::default(),
    );
    engine.recover().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let mut sources = Vec::new();
    for (reader, probe) in [(reader_a, probe_a), (reader_b, probe_b)] {
        let chain = reader.chain();
        let chain_config = config.chain(chain);
        let resume = ledger.load_cursor(chain).await?;
        let watcher_config = WatcherConfig {
            poll_interval: config.poll_interval(),
            confirmations: chain_config.finality_blocks,
            max_block_range: config.relayer.max_block_range,
            start_block: chain_config
                .start_block
                .unwrap_or_else(|| probe.latest_block.saturating_sub(chain_config.finality_blocks)),
            backoff: config.retry_config(),
            ..WatcherConfig::default()
        };
        tracing::info!(
            chain = %chain,
            resume = ?resume,
            start_block = watcher_config.start_block,
            "Starting event source"
        );
        let source = EventSource::new(reader, watcher_config, resume);
        sources.push(tokio::spawn(
            source.run(events_tx.clone(), shutdown_rx.clone()),
        ));
    }

    let api_state = AppState::new(EngineHandle::new(engine.clone(), events_tx.clone()));
    let api_shutdown = shutdown_rx.clone();
    let bind_address = config.api.bind_address.clone();
    let port = config.api.port;
    tokio::spawn(async move {
        if let Err(e) = api::start_server(&bind_address, port, api_state, api_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // The API holds a sender; the engine stops on the shutdown signal
    drop(events_tx);
    metrics::UP.set(1.0);
    tracing::info!("Coordinator running");

    let result = engine.run(events_rx, shutdown_rx).await;
    metrics::UP.set(0.0);

    for source in futures::future::join_all(sources).await {
        match source {
            Ok(Err(e)) => tracing::error!(error = %e, "Event source error"),
            Err(e) => tracing::error!(error = %e, "Event source task panicked"),
            Ok(Ok(())) => {}
        }
    }

    tracing::info!("Bridge relay coordinator stopped");
    result
}

fn log_deployments(config: &Config) {
    for chain in [Chain::A, Chain::B] {
        let chain_config = config.chain(chain);
        match &chain_config.deployment {
            Some(Deployment::L1(d)) => tracing::info!(
                chain = %chain,
                network = %d.network,
                l1_bridge = %d.l1_bridge,
                l1_token = %d.l1_token,
                deployer = ?d.deployer,
                "Loaded deployment record"
            ),
            Some(Deployment::L2(d)) => tracing::info!(
                chain = %chain,
                network = %d.network,
                l2_bridge = %d.l2_bridge,
                l2_token = %d.l2_token,
                l1_token_mapped = %d.l1_token_mapped,
                deployer = ?d.deployer,
                "Loaded deployment record"
            ),
            None => tracing::info!(
                chain = %chain,
                bridge = %chain_config.bridge_address,
                "No deployment record; using configured bridge address"
            ),
        }
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_coordinator=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
