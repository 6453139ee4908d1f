// Drop: share a directory on the LAN, discover peers, clone a peer's share.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use drop_core::Keypair;
use drop_node::discovery::{
    Discovery, FixedAddr, LocalAddr, MdnsDiscovery, RoutedAddr, ServiceRegistration,
};
use drop_node::{config, strategy, tls, Acceptor, Config, Listener, Requester, Server, Share};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "drop", version, about = "Share and clone directories between LAN peers")]
struct Cli {
    /// Config file (default: ~/.config/drop/config.toml, then /etc/drop/config.toml)
    #[arg(long, global = true, env = "DROP_CONFIG")]
    config: Option<PathBuf>,
    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Advertise DIR over mDNS and serve it until interrupted
    Share { dir: PathBuf },
    /// List peers advertising a share
    Discover {
        /// Seconds to browse (default: discovery_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Clone PEER's share into DEST
    Clone { peer: String, dest: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load(),
    };
    let keypair = Arc::new(Keypair::generate());
    let uid = cfg
        .uid
        .clone()
        .unwrap_or_else(|| keypair.device_id().to_string());

    match cli.command {
        Command::Share { dir } => share(&cfg, &uid, keypair, dir).await,
        Command::Discover { timeout } => {
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| cfg.discovery_timeout());
            discover(&cfg, timeout).await
        }
        Command::Clone { peer, dest } => clone(&cfg, &uid, keypair, &peer, dest).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn share(
    cfg: &Config,
    uid: &str,
    keypair: Arc<Keypair>,
    dir: PathBuf,
) -> anyhow::Result<()> {
    let share = Share::new(dir, cfg.codec)?;
    let acceptor = match (&cfg.tls.cert, &cfg.tls.key) {
        (Some(cert), Some(key)) => Acceptor::Tls(tls::server_acceptor(cert, key)?),
        (None, None) => Acceptor::Plain,
        _ => anyhow::bail!("tls.cert and tls.key must be set together"),
    };
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cfg.port));
    let listener = Listener::bind(bind, acceptor).await?;
    let port = listener.local_addr()?.port();

    let local: Box<dyn LocalAddr> = match cfg.ip {
        Some(ip) => Box::new(FixedAddr(ip)),
        None => Box::new(RoutedAddr),
    };
    let ip = local.ipv4().context("looking up the LAN address to advertise")?;
    let droplet = cfg.droplet(uid);
    let discovery = MdnsDiscovery::new(cfg.service_name.clone())?;
    discovery.register(&ServiceRegistration::new(uid, &droplet, ip, port))?;

    let server = Server::new(listener, share, droplet).with_keypair(keypair);
    server.serve(shutdown_signal()).await?;
    drop(discovery);
    Ok(())
}

async fn discover(cfg: &Config, timeout: Duration) -> anyhow::Result<()> {
    let discovery = MdnsDiscovery::new(cfg.service_name.clone())?;
    let peers = discovery.browse(timeout).await?;
    if peers.is_empty() {
        info!("no peers found within {:?}", timeout);
    }
    for peer in peers {
        let addrs: Vec<String> = peer.candidates().iter().map(|a| a.to_string()).collect();
        println!(
            "{}\t{}\t{}",
            peer.instance,
            peer.droplet().unwrap_or(&peer.host),
            addrs.join(" ")
        );
    }
    Ok(())
}

async fn clone(
    cfg: &Config,
    uid: &str,
    keypair: Arc<Keypair>,
    peer: &str,
    dest: PathBuf,
) -> anyhow::Result<()> {
    let strategy = strategy::build(cfg, uid)?;
    let mut requester = Requester::new(strategy, cfg.droplet(uid), cfg.codec);
    if cfg.handshake {
        requester = requester.with_handshake(keypair);
    }
    let outcome = requester
        .clone_into(peer, &dest)
        .await
        .with_context(|| format!("cloning {peer}"))?;
    if !outcome.encrypted {
        warn!("transfer from {} was not encrypted", peer);
    }
    println!(
        "cloned {:?} from {}: {} files, {} directories, {} bytes into {}",
        outcome.header.name,
        peer,
        outcome.stats.files,
        outcome.stats.dirs,
        outcome.stats.bytes,
        dest.display()
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
