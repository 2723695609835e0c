//! `quayd`: the Quay orchestrator daemon.
//!
//! Binary entrypoint that wires the peer prober, dedup registries, staging
//! zones, check queue and shuttle registry into a running orchestrator
//! that shuttles connect to over iroh QUIC.
//!
//! # Usage
//!
//! ```text
//! quayd start                               # start the orchestrator
//! quayd start -c quay.toml                  # start with a config file
//! quayd start -d ./orch2 --secret s3cr3t    # second instance
//! quayd ping --peer <endpoint_id> -n 3      # rank peers by latency
//! ```

mod config;
mod handler;
mod sink;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, SecretKey};
use quay_engine::Orchestrator;
use quay_net::{AddressBook, QuayTransport};
use quay_probe::{PeerProber, PingManyResult};
use quay_queue::CheckReceiver;
use quay_types::PeerId;
use tokio::sync::watch;
use tracing::{info, warn};

use config::CliConfig;
use handler::ShuttleProtocol;
use sink::LoggingDealSink;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "quayd", version, about = "Quay content orchestrator daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Shared secret; shuttles must use the same one.
        ///
        /// Can also be set via QUAY_SECRET env var or `[cluster] secret` in
        /// the config file. If none is provided, a random secret is generated
        /// and displayed.
        #[arg(long, env = "QUAY_SECRET")]
        secret: Option<String>,

        /// Use an ephemeral node key instead of the one in the data directory.
        #[arg(short, long)]
        memory: bool,

        /// Start with deal making disabled.
        #[arg(long)]
        no_deals: bool,
    },

    /// Ping peers once and print the closest ones.
    Ping {
        /// Peer(s) to probe: `<endpoint_id>` or `<endpoint_id>@<host:port>`.
        #[arg(short, long, required = true)]
        peer: Vec<String>,

        /// Number of peers to print.
        #[arg(short = 'n', long, default_value = "3")]
        top: usize,

        /// Shared secret the peers were started with.
        #[arg(long, env = "QUAY_SECRET")]
        secret: Option<String>,
    },
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    setup_tracing(&config.log.level);

    match cli.command {
        Commands::Start {
            data_dir,
            secret,
            memory,
            no_deals,
        } => {
            // CLI args override config file values.
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(s) = secret {
                config.cluster.secret = s;
            }
            if no_deals {
                config.deal.disabled = true;
            }
            cmd_start(config, memory).await
        }
        Commands::Ping { peer, top, secret } => {
            if let Some(s) = secret {
                config.cluster.secret = s;
            }
            cmd_ping(&config, &peer, top).await
        }
    }
}

/// Initialize the `tracing` subscriber with the given level filter.
///
/// Respects `RUST_LOG` env var if set, otherwise uses the config value.
fn setup_tracing(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// -----------------------------------------------------------------------
// quayd start
// -----------------------------------------------------------------------

async fn cmd_start(mut config: CliConfig, memory: bool) -> Result<()> {
    info!("starting quayd");
    let orch_config = config.orchestrator().context("invalid configuration")?;
    info!(
        data_dir = %config.node.data_dir.display(),
        min_zone_size = orch_config.staging.min_size,
        queue_capacity = orch_config.queue.capacity,
        deal_making_disabled = orch_config.deal_making_disabled,
        "orchestrator configuration"
    );

    // --- Node identity (iroh SecretKey) ---
    let secret_key = if memory {
        info!("generated ephemeral node key (memory mode)");
        random_secret_key()
    } else {
        std::fs::create_dir_all(&config.node.data_dir)
            .context("failed to create data directory")?;
        load_or_create_secret_key(&config.node.data_dir)?
    };
    let peer_id = PeerId::from(*secret_key.public().as_bytes());
    info!(peer = %peer_id.fmt_short(), "node identity");

    // --- Deployment secret ---
    let generated_secret = config.cluster.secret.is_empty();
    if generated_secret {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        config.cluster.secret = bytes.iter().map(|b| format!("{b:02x}")).collect();
    }
    let alpn = quay_net::cluster_alpn(config.cluster.secret.as_bytes());
    info!(
        deployment_id = %blake3::hash(config.cluster.secret.as_bytes()).to_hex()[..16],
        "deployment identity derived from secret"
    );

    // --- Network ---
    let endpoint = bind_endpoint(secret_key, alpn.clone()).await?;
    let address_book = Arc::new(AddressBook::new());
    let seeds = seed_peers(&address_book, &config.cluster.peers);
    let transport = Arc::new(QuayTransport::from_endpoint_with_alpn(
        endpoint.clone(),
        alpn.clone(),
        address_book.clone(),
    ));

    // --- Orchestrator ---
    let (orchestrator, checks, inbound) =
        Orchestrator::new(orch_config, transport, address_book);
    let orchestrator = Arc::new(orchestrator);

    // The Router runs the accept loop and hands shuttle connections to
    // the protocol handler.
    let router = Router::builder(endpoint.clone())
        .accept(alpn, ShuttleProtocol::new(orchestrator.clone()))
        .spawn();

    if generated_secret {
        info!("deployment secret (generated): {}", config.cluster.secret);
    }
    info!(
        "shuttles connect with: --secret {} --orchestrator {}",
        config.cluster.secret,
        endpoint.id()
    );

    // --- Background loops ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sealer = orchestrator.zone_sealer(Arc::new(LoggingDealSink));
    let sealer_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sealer.run(shutdown).await })
    };

    let checks_task = tokio::spawn(run_checks(checks, shutdown_rx.clone()));

    let ingress_task = {
        let orchestrator = orchestrator.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = orchestrator.run_ingress(inbound) => {}
                _ = shutdown.changed() => {}
            }
        })
    };

    if !seeds.is_empty() {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { log_initial_ranking(&orchestrator, seeds).await });
    }

    info!("quayd ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    for task in [sealer_task, checks_task, ingress_task] {
        if let Err(e) = task.await {
            warn!(error = %e, "background task failed");
        }
    }

    // Stops accepting new connections, waits for in-flight handlers, then
    // closes the endpoint.
    info!("shutting down iroh router");
    router.shutdown().await.context("router shutdown failed")?;

    Ok(())
}

/// Consume the check queue until shutdown.
async fn run_checks(mut checks: CheckReceiver, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            next = checks.recv() => match next {
                Some(content_id) => info!(content = %content_id, "content check due"),
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    info!("check consumer stopped");
}

/// Probe the configured peers once at startup.
async fn log_initial_ranking(orchestrator: &Orchestrator, peers: Vec<(EndpointAddr, PeerId)>) {
    let total = peers.len();
    let result = orchestrator.prober().ping_many(peers).await;
    for (peer, rtt) in result.ranked() {
        info!(peer = %peer.fmt_short(), rtt_ms = rtt.as_millis() as u64, "peer reachable");
    }
    if result.len() < total {
        warn!(answered = result.len(), total, "some configured peers did not answer");
    }
}

// -----------------------------------------------------------------------
// quayd ping
// -----------------------------------------------------------------------

async fn cmd_ping(config: &CliConfig, peers: &[String], top: usize) -> Result<()> {
    let targets = peers
        .iter()
        .map(|s| parse_peer(s))
        .collect::<Result<Vec<_>>>()?;

    let alpn = quay_net::cluster_alpn(config.cluster.secret.as_bytes());
    let endpoint = bind_endpoint(random_secret_key(), alpn.clone()).await?;
    let address_book = Arc::new(AddressBook::new());
    let transport = Arc::new(QuayTransport::from_endpoint_with_alpn(
        endpoint,
        alpn,
        address_book.clone(),
    ));

    let probe = config.orchestrator().context("invalid configuration")?.probe;
    let prober = PeerProber::new(transport.clone(), address_book, probe);
    let asked: HashSet<PeerId> = targets.iter().map(|(_, peer)| *peer).collect();
    let result = prober.ping_many(targets).await;

    for line in ping_report(&result, asked.len(), top) {
        println!("{line}");
    }

    transport.close().await;
    Ok(())
}

/// Summary line followed by the `top` fastest peers.
fn ping_report(result: &PingManyResult, asked: usize, top: usize) -> Vec<String> {
    let mut lines = vec![format!("{} of {asked} peers answered", result.len())];
    for peer in result.top_peers(top) {
        if let Some(rtt) = result.get(&peer) {
            lines.push(format!("{peer}  {:.1} ms", rtt.as_secs_f64() * 1_000.0));
        }
    }
    lines
}

// -----------------------------------------------------------------------
// Networking helpers
// -----------------------------------------------------------------------

async fn bind_endpoint(secret_key: SecretKey, alpn: Vec<u8>) -> Result<Endpoint> {
    Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![alpn])
        .relay_mode(iroh::RelayMode::Default)
        .bind()
        .await
        .context("failed to bind iroh endpoint")
}

/// Add the configured peers to the address book, skipping invalid entries.
fn seed_peers(book: &AddressBook, peers: &[String]) -> Vec<(EndpointAddr, PeerId)> {
    let mut seeded = Vec::with_capacity(peers.len());
    for s in peers {
        match parse_peer(s) {
            Ok((addr, peer)) => {
                book.insert_permanent(peer, addr.clone());
                seeded.push((addr, peer));
            }
            Err(e) => warn!(peer = %s, error = %e, "ignoring invalid peer"),
        }
    }
    seeded
}

/// Parse a peer string.
///
/// Formats:
/// - `<endpoint_id>`: hex-encoded 32-byte public key (iroh relay used for discovery)
/// - `<endpoint_id>@<host:port>`: with an explicit direct address
fn parse_peer(s: &str) -> Result<(EndpointAddr, PeerId)> {
    let (id_str, addr_str) = match s.split_once('@') {
        Some((id, addr)) => (id, Some(addr)),
        None => (s, None),
    };

    let endpoint_id: iroh::EndpointId = id_str
        .parse()
        .context("invalid endpoint ID (expected hex-encoded public key)")?;

    let mut endpoint_addr = EndpointAddr::new(endpoint_id);
    if let Some(addr) = addr_str {
        let socket_addr: SocketAddr = addr
            .parse()
            .context("invalid socket address in peer (expected host:port)")?;
        endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
    }

    let peer_id = PeerId::from(*endpoint_id.as_bytes());

    Ok((endpoint_addr, peer_id))
}

// -----------------------------------------------------------------------
// Key management
// -----------------------------------------------------------------------

fn random_secret_key() -> SecretKey {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    SecretKey::from(bytes)
}

/// Load or create a persistent iroh secret key from `data_dir/node.key`.
///
/// Gives the orchestrator a stable identity across restarts, so shuttles
/// configured with its endpoint id keep finding it.
fn load_or_create_secret_key(data_dir: &Path) -> Result<SecretKey> {
    let key_path = data_dir.join("node.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("failed to read node.key")?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("node.key must be exactly 32 bytes"))?;
        let key = SecretKey::from_bytes(&arr);
        info!(
            endpoint_id = %key.public().fmt_short(),
            "loaded existing node key"
        );
        Ok(key)
    } else {
        let key = random_secret_key();
        std::fs::write(&key_path, key.to_bytes()).context("failed to write node.key")?;
        info!(
            path = %key_path.display(),
            endpoint_id = %key.public().fmt_short(),
            "generated new node key"
        );
        Ok(key)
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
