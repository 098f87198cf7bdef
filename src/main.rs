use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use peerscore::{
    ChainClient, Collaborators, Keypair, LocalChain, RegistrationSigner, RegistrySnapshot,
    RpcServer, ServiceApiClient, TcpRpc, Validator, ValidatorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "peerscore")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the peer RPC server listens on.
    #[arg(short, long, env = "PEERSCORE_BIND", default_value = "0.0.0.0:8091")]
    bind: SocketAddr,

    /// JSON file describing the development chain.
    #[arg(long, env = "PEERSCORE_CHAIN_FILE")]
    chain_file: PathBuf,

    /// Base URL of the scoring / registration service.
    #[arg(long, env = "PEERSCORE_SERVICE_URL")]
    service_url: String,

    #[arg(long, env = "PEERSCORE_KEY_FILE", default_value = "validator.key")]
    key_file: PathBuf,

    #[arg(long, env = "PEERSCORE_NETUID", default_value = "2")]
    netuid: u16,

    #[arg(long, env = "PEERSCORE_CHAIN", default_value = "bittensor")]
    chain: String,

    #[arg(short = 'k', long, env = "PEERSCORE_SAMPLE_SIZE", default_value = "10")]
    sample_size: usize,

    #[arg(long, env = "PEERSCORE_MAX_CONCURRENCY", default_value = "3")]
    max_concurrency: usize,

    #[arg(long, env = "PEERSCORE_PER_PEER_TIMEOUT_MS", default_value = "12000")]
    per_peer_timeout_ms: u64,

    #[arg(long, env = "PEERSCORE_ROUND_DEADLINE_MS", default_value = "15000")]
    round_deadline_ms: u64,

    /// Sleep between rounds.
    #[arg(long, env = "VALIDATOR_SLEEP_TIME", default_value = "1000")]
    round_interval_ms: u64,

    #[arg(long, env = "PEERSCORE_ALPHA", default_value = "0.1")]
    alpha: f64,

    #[arg(long, env = "PEERSCORE_EPOCH_LENGTH", default_value = "100")]
    epoch_length: u64,

    #[arg(long, env = "PEERSCORE_DISABLE_SET_WEIGHTS")]
    disable_set_weights: bool,

    /// Registration token lifetime in minutes.
    #[arg(long, env = "NEURON_JWT_EXPIRE_IN", default_value = "30")]
    token_ttl_minutes: u64,

    /// Skip the peer listing service and always sample at random.
    #[arg(long, env = "PEERSCORE_NO_PEER_LISTING")]
    no_peer_listing: bool,

    #[arg(long, env = "PEERSCORE_STATE_PATH")]
    state_path: Option<PathBuf>,

    #[arg(long, env = "PEERSCORE_CREDENTIAL_PATH")]
    credential_path: Option<PathBuf>,
}

impl Args {
    fn config(&self) -> ValidatorConfig {
        ValidatorConfig {
            netuid: self.netuid,
            chain: self.chain.clone(),
            sample_size: self.sample_size,
            max_concurrency: self.max_concurrency,
            per_peer_timeout: Duration::from_millis(self.per_peer_timeout_ms),
            round_deadline: Duration::from_millis(self.round_deadline_ms),
            round_interval: Duration::from_millis(self.round_interval_ms),
            moving_average_alpha: self.alpha,
            epoch_length: self.epoch_length,
            disable_set_weights: self.disable_set_weights,
            token_ttl: Duration::from_secs(self.token_ttl_minutes * 60),
            use_peer_listing: !self.no_peer_listing,
            state_path: self.state_path.clone(),
            credential_path: self.credential_path.clone(),
            ..ValidatorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let keypair = Arc::new(Keypair::load_or_generate(&args.key_file)?);
    let chain = Arc::new(LocalChain::load(&args.chain_file)?);
    let service = Arc::new(ServiceApiClient::new(&args.service_url)?);

    let registered = RegistrySnapshot::new(chain.peer_registry_snapshot().await?, 0);
    let uid = registered
        .uid_of(&keypair.account())
        .context("signing key is not registered in the chain file")?;

    let validator = Validator::startup(
        args.config(),
        Collaborators {
            rpc: Arc::new(TcpRpc::new(uid)),
            chain,
            scorer: service.clone(),
            registration: service.clone(),
            listing: Some(service),
            signer: keypair,
        },
    )
    .await?;

    let server = RpcServer::bind(args.bind, validator.self_uid()).await?;
    let serve = tokio::spawn(server.serve(validator.clone(), validator.shutdown_signal()));
    let mut rounds = tokio::spawn(validator.clone().run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting gracefully");
        }
        finished = &mut rounds => {
            warn!(result = ?finished, "round loop exited");
        }
    }

    validator.shutdown().await;
    if !rounds.is_finished() {
        match rounds.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "round loop exited with error"),
            Err(e) => warn!(error = %e, "round loop task failed"),
        }
    }
    if let Err(e) = serve.await {
        warn!(error = %e, "rpc server task failed");
    }

    Ok(())
}
