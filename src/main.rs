//! Bridge validator entrypoint.
//!
//! Verbs:
//! - `start` – run the node: watchers, gossip, coordinator, status HTTP.
//! - `generate-key` – mint fresh secp256k1 and ed25519 validator keys.
//! - `check-config` – validate configuration and print a summary.
//! - `status` / `stats` – query a running node's status HTTP.
//!
//! Exit codes: 0 success, 1 configuration error, 2 runtime fatal.

mod backend;
mod chain;
mod config;
mod coordinator;
mod gossip;
mod handlers;
mod relay;
mod resolver;
mod signing;
mod store;
mod types;
mod watcher;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

use crate::backend::Backend;
use crate::chain::unit0::Unit0Client;
use crate::chain::waves::WavesClient;
use crate::config::Config;
use crate::coordinator::{Coordinator, NodeStatus};
use crate::gossip::GossipConfig;
use crate::relay::RelayEngine;
use crate::resolver::AssetResolver;
use crate::signing::SigningEngine;
use crate::store::Store;
use crate::watcher::{WatcherConfig, run_watcher};

const EXIT_CONFIG: u8 = 1;
const EXIT_FATAL: u8 = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "bridge-validator", version)]
#[command(about = "Validator node for the Waves <-> Unit Zero token bridge")]
struct Cli {
    /// Path to a JSON configuration file; options fall back to env vars.
    #[arg(long, short, env = "CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the validator node.
    Start,
    /// Generate fresh secp256k1 and ed25519 validator keys.
    GenerateKey,
    /// Validate the configuration and print a summary.
    CheckConfig,
    /// Show a running node's status.
    Status,
    /// Show a running node's transfer statistics.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateKey => {
            init_tracing("info");
            generate_key();
            ExitCode::SUCCESS
        }
        Command::CheckConfig => match load_config(cli.config.as_deref()) {
            Ok(config) => {
                println!("{config}");
                println!("configuration ok");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("configuration error: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
        },
        Command::Status => query_running_node(cli.config.as_deref(), "status").await,
        Command::Stats => query_running_node(cli.config.as_deref(), "stats").await,
        Command::Start => match load_config(cli.config.as_deref()) {
            Err(e) => {
                eprintln!("configuration error: {e}");
                ExitCode::from(EXIT_CONFIG)
            }
            Ok(config) => {
                init_tracing(&config.log_level);
                match run_node(config).await {
                    Ok(()) => ExitCode::SUCCESS,
                    Err(detail) => {
                        tracing::error!(%detail, "Node terminated fatally");
                        ExitCode::from(EXIT_FATAL)
                    }
                }
            }
        },
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config, config::ConfigError> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

fn generate_key() {
    use rand::Rng;
    let secp = alloy::signers::local::PrivateKeySigner::random();
    let seed: [u8; 32] = rand::rng().random();
    let waves = crate::signing::WavesKeypair::from_seed(&seed);
    println!(
        "validator_secp256k1_key: 0x{}",
        hex::encode(secp.to_bytes())
    );
    println!("unit0 validator address: {:#x}", secp.address());
    println!(
        "validator_ed25519_seed:  {}",
        bs58::encode(seed).into_string()
    );
    println!("waves validator pubkey:  {}", waves.public_key_b58());
}

/// `status` / `stats` verbs: read the local node's status HTTP.
async fn query_running_node(config_path: Option<&std::path::Path>, endpoint: &str) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let url = format!("http://127.0.0.1:{}/{endpoint}", config.status_http.port);
    match reqwest::get(&url).await {
        Ok(response) => match response.json::<serde_json::Value>().await {
            Ok(body) => {
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("malformed response from {url}: {e}");
                ExitCode::from(EXIT_FATAL)
            }
        },
        Err(e) => {
            eprintln!("node not reachable at {url}: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run_node(config: Config) -> Result<(), String> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Bridge validator starting"
    );
    // Lock amounts are relayed verbatim; the contracts own any decimal
    // rescaling and are expected to emit net-of-fee amounts.
    tracing::info!("Relaying source-side amounts unchanged (no decimal rescaling)");

    let store = Store::open(&config.data_dir).map_err(|e| e.to_string())?;
    if let Some(height) = config.start_block_waves {
        store
            .force_watermark("waves", height)
            .map_err(|e| e.to_string())?;
        tracing::info!(height, "Waves watermark forced by operator override");
    }
    if let Some(height) = config.start_block_unit0 {
        store
            .force_watermark("unit0", height)
            .map_err(|e| e.to_string())?;
        tracing::info!(height, "Unit0 watermark forced by operator override");
    }

    let network_byte = config.waves_network_byte().map_err(|e| e.to_string())?;
    let signer = config
        .validator_secp256k1_key
        .as_ref()
        .expect("validated")
        .signer();
    let seed = config.validator_ed25519_seed.map(|s| *s.as_bytes());
    let signing = Arc::new(SigningEngine::new(
        signer.clone(),
        seed.as_ref(),
        config.unit0.chain_id,
    ));
    if signing.waves_validator_id().is_none() {
        tracing::warn!("No ed25519 seed configured; Waves-destination transfers are disabled");
    }

    let unit0_bridge = config
        .unit0
        .bridge_address
        .as_deref()
        .expect("validated")
        .parse()
        .expect("validated");
    let unit0 = Arc::new(Unit0Client::connect(
        config.unit0.rpc_url.as_ref().expect("validated"),
        signer,
        config.unit0.chain_id,
        unit0_bridge,
        network_byte,
    ));
    let waves = Arc::new(
        WavesClient::new(
            config.waves.node_url.clone().expect("validated"),
            config.waves.bridge_address.clone().expect("validated"),
            network_byte,
            config.unit0.chain_id,
        )
        .map_err(|e| e.to_string())?,
    );

    let resolver = AssetResolver::new(unit0.clone(), waves.clone());
    let relay = RelayEngine::new(unit0.clone(), waves.clone(), signing.clone());
    let backend = Arc::new(Backend::new(
        unit0.clone(),
        waves.clone(),
        resolver,
        relay,
    ));
    let status = Arc::new(NodeStatus::new(
        signing.unit0_validator_id(),
        signing.waves_validator_id(),
    ));

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone()).map_err(|e| e.to_string())?;

    let (events_tx, events_rx) = mpsc::channel(1024);

    let gossip = gossip::spawn(
        GossipConfig {
            listen_port: config.overlay.listen_port,
            bootstrap_peers: config.overlay.bootstrap_peers.clone(),
            validator_id: signing.unit0_validator_id(),
        },
        events_tx.clone(),
        cancel.clone(),
    )
    .map_err(|e| e.to_string())?;

    let tracker = TaskTracker::new();
    tracker.spawn(run_watcher(
        waves.clone(),
        WatcherConfig::for_waves(config.waves.confirmations),
        store.clone(),
        events_tx.clone(),
        cancel.clone(),
    ));
    tracker.spawn(run_watcher(
        unit0.clone(),
        WatcherConfig::for_unit0(config.unit0.confirmations),
        store.clone(),
        events_tx.clone(),
        cancel.clone(),
    ));

    if config.status_http.enabled {
        let state = handlers::AppState {
            store: store.clone(),
            status: status.clone(),
            gossip: Some(gossip.clone()),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], config.status_http.port));
        let http_cancel = cancel.clone();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| format!("failed to bind status HTTP on {addr}: {e}"))?;
        tracing::info!(%addr, "Status HTTP listening");
        tracker.spawn(async move {
            let shutdown = async move { http_cancel.cancelled().await };
            let router = handlers::routes(state)
                .layer(tower_http::trace::TraceLayer::new_for_http());
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "Status HTTP server failed");
            }
        });
    }
    tracker.close();

    let coordinator = Coordinator::new(
        store.clone(),
        signing,
        backend,
        Some(gossip),
        status,
        cancel.clone(),
    );
    let result = coordinator.run(events_rx).await;

    // Bounded graceful shutdown: watchers finish their current batch, the
    // HTTP server drains, then we give up.
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown watchdog expired; abandoning remaining tasks");
    }
    store.flush().map_err(|e| e.to_string())?;
    tracing::info!("Bridge validator stopped");
    result
}

fn spawn_signal_handler(cancel: CancellationToken) -> Result<(), std::io::Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received; shutting down"),
            _ = sigint.recv() => tracing::info!("SIGINT received; shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}
