//! Keel - control-plane bootstrap and orchestration engine

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keel::component::Manager;
use keel::components::ca_syncer::CaSyncer;
use keel::components::certificates::Certificates;
use keel::components::reconciler::{LeaderReconciler, TokenSweeper};
use keel::components::storage::StorageEngine;
use keel::components::JoinContext;
use keel::config::{ClusterConfig, KeelVars, DEFAULT_JOIN_PORT};
use keel::join::server::{JoinServer, JoinState, PeerRegistry};
use keel::leader::{self, Elector as _};
use keel::pki::CertManager;
use keel::token::{JoinToken, TokenRole, TokenStore, DEFAULT_TOKEN_TTL};

/// Keel - control-plane bootstrap and orchestration engine
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as a cluster controller
    ///
    /// A fresh first controller mints the cluster CA; given a join
    /// token it joins an existing cluster instead, fetching trust
    /// material over the pinned channel before anything else starts.
    Controller(ControllerArgs),

    /// Issue a join token for a new node
    Token(TokenArgs),

    /// Validate the cluster configuration file and exit
    Validate(ConfigArgs),
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Join token (omit to bootstrap a fresh cluster)
    join_token: Option<String>,

    /// Read the join token from a file instead
    #[arg(long)]
    token_file: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Parser, Debug)]
struct TokenArgs {
    /// Role the token entitles its bearer to join as
    #[arg(long, default_value = "worker")]
    role: TokenRole,

    /// Token lifetime in seconds
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL.as_secs())]
    expiry_secs: u64,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Parser, Debug)]
struct ConfigArgs {
    /// Path to the cluster configuration YAML
    #[arg(short = 'c', long = "config")]
    config_file: Option<PathBuf>,

    /// Data directory
    #[arg(long, default_value = "/var/lib/keel")]
    data_dir: PathBuf,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<(ClusterConfig, KeelVars)> {
        let config = ClusterConfig::load(self.config_file.as_deref())
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {}", e))?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;
        Ok((config, KeelVars::new(self.data_dir.clone())))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    // This MUST succeed for the application to operate securely.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The node cannot serve or verify TLS without it.",
            e
        );
        std::process::exit(1);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Controller(args) => run_controller(args).await,
        Commands::Token(args) => run_token_create(args).await,
        Commands::Validate(args) => {
            let (config, _) = args.load()?;
            println!("configuration OK ({} storage)", config.storage.type_);
            Ok(())
        }
    }
}

/// Issue a join token against this node's CA and registry
async fn run_token_create(args: TokenArgs) -> anyhow::Result<()> {
    let (config, vars) = args.config.load()?;
    if !vars.has_ca_material() {
        anyhow::bail!(
            "no cluster CA at {}; run the controller first",
            vars.ca_cert_path().display()
        );
    }

    let ca_cert = std::fs::read_to_string(vars.ca_cert_path())?;
    let token = JoinToken::issue(args.role, vec![config.api.join_address_url()], &ca_cert)
        .map_err(|e| anyhow::anyhow!("token issuance failed: {}", e))?;

    let store = TokenStore::new();
    store
        .reload(&vars.token_registry_path())
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    store.insert(
        &token.token,
        args.role,
        Duration::from_secs(args.expiry_secs),
    );
    store
        .save(&vars.token_registry_path())
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    println!(
        "{}",
        token
            .encode()
            .map_err(|e| anyhow::anyhow!("token encoding failed: {}", e))?
    );
    Ok(())
}

/// Run in controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("keel controller starting");

    let (config, vars) = args.config.load()?;
    vars.init_directories()
        .map_err(|e| anyhow::anyhow!("failed to prepare data directory: {}", e))?;

    let join_token = read_join_token(&args)?;
    let node_name = node_name();
    let peer_url = config.storage.peer_url();

    let cert_manager = Arc::new(CertManager::new(vars.clone()));
    let join_ctx = Arc::new(JoinContext::new());
    let tokens = Arc::new(TokenStore::new());
    tokens
        .reload(&vars.token_registry_path())
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let mut manager = Manager::new();

    // Sync phase: trust establishment strictly precedes everything else.
    manager
        .register(
            Arc::new(CaSyncer::new(
                vars.clone(),
                join_token,
                peer_url.clone(),
                join_ctx.clone(),
            )),
            true,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    manager
        .register(
            Arc::new(Certificates::new(
                cert_manager.clone(),
                config.clone(),
                vars.clone(),
            )),
            true,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    manager.init().await.map_err(|e| {
        anyhow::anyhow!("trust establishment failed, refusing to start: {}", e)
    })?;

    // Async phase. The CA exists on disk now, so components that serve
    // with it can be built.
    let ca_cert = std::fs::read_to_string(vars.ca_cert_path())?;
    let ca_key = std::fs::read_to_string(vars.ca_key_path())?;

    manager
        .register(
            Arc::new(StorageEngine::new(
                vars.clone(),
                config.storage.clone(),
                node_name.clone(),
                cert_manager.clone(),
                join_ctx.clone(),
            )),
            false,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let join_state = Arc::new(JoinState {
        tokens: tokens.clone(),
        peers: Arc::new(PeerRegistry::new(&node_name, &peer_url)),
        ca_cert,
        ca_key,
        api_server_url: config.api.api_address_url(),
        token_registry: Some(vars.token_registry_path()),
    });
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], DEFAULT_JOIN_PORT));
    manager
        .register(
            Arc::new(JoinServer::new(
                join_state,
                cert_manager.clone(),
                bind_addr,
                config.api.all_sans(),
            )),
            false,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let elector = leader::elector_for(&config.api.external_address, &node_name);
    let leadership = elector.leadership();
    manager
        .register(elector.clone(), false)
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    manager
        .register(
            Arc::new(LeaderReconciler::new(
                Arc::new(TokenSweeper::new(tokens)),
                leadership,
            )),
            false,
        )
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let cancel = CancellationToken::new();
    manager
        .start(cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    tracing::info!(node = %node_name, "keel controller running");

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");

    cancel.cancel();
    if let Err(e) = manager.stop().await {
        tracing::error!(error = %e, "errors while stopping components");
    }

    tracing::info!("keel controller shut down");
    Ok(())
}

/// Resolve the join token from the CLI, a file, or neither
fn read_join_token(args: &ControllerArgs) -> anyhow::Result<Option<JoinToken>> {
    let encoded = match (&args.join_token, &args.token_file) {
        (Some(_), Some(_)) => {
            anyhow::bail!("pass a join token either inline or via --token-file, not both")
        }
        (Some(t), None) => Some(t.clone()),
        (None, Some(path)) => Some(std::fs::read_to_string(path)?),
        (None, None) => None,
    };
    encoded
        .map(|e| JoinToken::decode(&e).map_err(|e| anyhow::anyhow!("invalid join token: {}", e)))
        .transpose()
}

fn node_name() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "keel-node".to_string())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
