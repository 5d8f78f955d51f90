#![doc = include_str!("../README.md")]

use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use bitcoin::Network;
use clap::{command, Parser};
use secp256k1::{PublicKey, SecretKey};
use tokio::task::JoinHandle;
use tracing::{error, info, subscriber::set_global_default};
use tracing_subscriber::filter::EnvFilter;

use anchorage_bitcoin_client::BitcoinClient;
use anchorage_prover::{ComputationSigner, ProverConfig, WitnessKey, MAX_MIN_CONFIRMATIONS};

use crate::{
    app::{create_app, AppConfig, SignerKey},
    collector::ProofCollector,
    proving::ProofBuilder,
    relayer::{Relayer, RelayerConfig},
    rpc::{RpcConfig, RpcServer},
    shutdown::Shutdown,
};

mod app;
mod collector;
mod event_sink;
#[cfg(test)]
mod fake_chain;
mod ledger_state;
mod proving;
mod relayer;
mod rpc;
mod shutdown;
mod store;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// RPC server host
    #[arg(long, default_value = "127.0.0.1:5000")]
    rpc_host: String,
    /// Bitcoin RPC URL
    #[arg(long, env = "BITCOIN_RPC")]
    bitcoin_rpc_url: String,
    /// Bitcoin RPC user:password (optional)
    #[arg(long, env = "USERPWD")]
    bitcoin_rpc_userpwd: Option<String>,
    /// Path to the database storing anchors and acknowledgements
    #[arg(long, default_value = "./.anchorage_data/ledger.db")]
    db_path: PathBuf,
    /// JSON lines file receiving prover events
    #[arg(long, default_value = "./.anchorage_data/events.jsonl")]
    events_path: PathBuf,
    /// Bitcoin network (bitcoin, testnet, signet, regtest)
    #[arg(long, default_value = "bitcoin")]
    network: Network,
    /// Hex encoded secret key of the computation unit
    #[arg(long, env = "SIGNER_KEY", conflicts_with = "signer_key_file")]
    signer_key: Option<String>,
    /// Sealed key file holding the computation unit's hex secret
    #[arg(long)]
    signer_key_file: Option<PathBuf>,
    /// Expected attested signer public key, defaults to the loaded key's
    #[arg(long)]
    attested_signer: Option<PublicKey>,
    /// Witness public key accepted in the quorum (repeatable)
    #[arg(long)]
    witness: Vec<PublicKey>,
    /// Comma separated witness secret keys co-signing locally produced proofs
    #[arg(long, env = "WITNESS_KEYS", value_delimiter = ',', hide_env_values = true)]
    witness_keys: Vec<String>,
    /// Minimum number of witness signatures per proof
    #[arg(long, default_value = "0")]
    min_witness: usize,
    /// Blocks required on top of an anchor or a transaction's block
    #[arg(
        long,
        default_value = "6",
        value_parser = clap::value_parser!(u32).range(1..=MAX_MIN_CONFIRMATIONS as i64)
    )]
    min_confirmations: u32,
    /// Headers per chunk proof
    #[arg(long, default_value = "100")]
    chunk_size: usize,
    /// Epoch-boundary block trusted as anchor #0 when the store is empty
    #[arg(long, default_value = "0")]
    seed_height: u64,
    /// Relaying lag in blocks, to address potential reorgs
    #[arg(long, default_value = "1")]
    block_lag: u64,
    /// Logging level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber_builder =
        tracing_subscriber::fmt::Subscriber::builder().with_env_filter(env_filter);

    let subscriber = subscriber_builder.with_writer(std::io::stderr).finish();
    set_global_default(subscriber).expect("Failed to set subscriber");
}

fn signer_key(cli: &Cli) -> Result<SignerKey, anyhow::Error> {
    match (&cli.signer_key, &cli.signer_key_file) {
        (Some(secret), _) => Ok(SignerKey::Hex(secret.clone())),
        (None, Some(path)) => Ok(SignerKey::SealedFile(path.clone())),
        (None, None) => anyhow::bail!("Either --signer-key or --signer-key-file is required"),
    }
}

fn witness_keys(secrets: &[String]) -> Result<Vec<WitnessKey>, anyhow::Error> {
    secrets
        .iter()
        .filter(|secret| !secret.trim().is_empty())
        .map(|secret| {
            SecretKey::from_str(secret.trim())
                .map(WitnessKey::new)
                .map_err(|e| anyhow::anyhow!("Invalid witness key: {}", e))
        })
        .collect()
}

/// Prover trust configuration; local witnesses are always part of the accepted set
fn prover_config(
    cli: &Cli,
    attested_signer: PublicKey,
    local_witnesses: &[WitnessKey],
) -> ProverConfig {
    let mut config = ProverConfig::new(cli.network, attested_signer);
    config.witnesses = cli
        .witness
        .iter()
        .copied()
        .chain(local_witnesses.iter().map(WitnessKey::public_key))
        .collect();
    config.min_witness = cli.min_witness;
    config.min_confirmations = cli.min_confirmations;
    config
}

#[tokio::main]
async fn main() {
    // Load environment variables from .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    info!("Anchorage node is launching...");

    let keys = signer_key(&cli).and_then(|signer_key| {
        let public_key = signer_key.load()?.public_key();
        Ok((signer_key, public_key, witness_keys(&cli.witness_keys)?))
    });
    let (signer_key, signer_public_key, local_witnesses) = match keys {
        Ok(keys) => keys,
        Err(err) => {
            error!("Failed to load keys: {}", err);
            std::process::exit(1);
        }
    };
    let prover = prover_config(
        &cli,
        cli.attested_signer.unwrap_or(signer_public_key),
        &local_witnesses,
    );
    let retarget_period = prover.chain_params.retarget_period;

    // Instantiating components and wiring them together
    let shutdown = Shutdown::default();

    let app_config = AppConfig {
        db_path: cli.db_path.clone(),
        events_path: cli.events_path.clone(),
        api_requests_capacity: 1000,
        bitcoin_rpc_url: cli.bitcoin_rpc_url.clone(),
        bitcoin_rpc_userpwd: cli.bitcoin_rpc_userpwd.clone(),
        prover,
        signer_key,
        seed_height: cli.seed_height,
    };
    let (mut app_server, app_client) = create_app(app_config, shutdown.subscribe());

    let builder = match ProofBuilder::new(app_client.clone(), local_witnesses, cli.chunk_size) {
        Ok(builder) => builder,
        Err(err) => {
            error!("Invalid chunk size: {}", err);
            std::process::exit(1);
        }
    };

    let relayer_config = RelayerConfig {
        rpc_url: cli.bitcoin_rpc_url.clone(),
        rpc_userpwd: cli.bitcoin_rpc_userpwd.clone(),
        block_lag: cli.block_lag,
        retarget_period,
        retry_interval: Duration::from_secs(60),
    };
    let mut relayer = Relayer::new(relayer_config, builder.clone(), shutdown.subscribe());

    let collector = match BitcoinClient::new(cli.bitcoin_rpc_url.clone(), cli.bitcoin_rpc_userpwd.clone()) {
        Ok(client) => ProofCollector::new(builder, Arc::new(client)),
        Err(err) => {
            error!("Failed to initialize the proof collector: {}", err);
            std::process::exit(1);
        }
    };

    let rpc_config = RpcConfig {
        rpc_host: cli.rpc_host,
        db_path: cli.db_path,
    };
    let rpc_server = RpcServer::new(rpc_config, app_client, collector, shutdown.subscribe());

    // Launching threads for each component
    let app_handle = tokio::spawn(async move { app_server.run().await });
    let relayer_handle = tokio::spawn(async move { relayer.run().await });
    let rpc_handle = tokio::spawn(async move { rpc_server.run().await });
    let shutdown_handle = tokio::spawn(async move { shutdown.run().await });

    // If at least one component exits with an error, the node will exit with an error
    match tokio::try_join!(
        flatten(app_handle),
        flatten(relayer_handle),
        flatten(rpc_handle),
        flatten(shutdown_handle)
    ) {
        Ok(_) => {
            info!("Anchorage node has shut down");
            std::process::exit(0);
        }
        Err(_) => {
            error!("Anchorage node has exited with error");
            std::process::exit(1);
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, ()>>) -> Result<T, ()> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(()),
    }
}
