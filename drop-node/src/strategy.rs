//! Connection strategies: turn a peer name into an open (optionally TLS) stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::config::Config;
use crate::discovery::{Discovery, MdnsDiscovery};
use crate::error::{DropError, Result};
use crate::holepunch::{HolePunchConfig, RelayTraversal, Traversal};
use crate::tls;

/// Any duplex byte stream a session can run over: TCP, TLS over TCP, or in-memory pipes in tests.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

pub type BoxStream = Box<dyn PeerStream>;

/// An open stream to a peer.
pub struct Connection {
    pub stream: BoxStream,
    /// The stream is TLS.
    pub encrypted: bool,
    pub peer: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    async fn connect(&self, peer: &str) -> Result<Connection>;
}

/// Configured strategy, resolved once at start-up by [`build`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum StrategyKind {
    #[default]
    #[serde(rename = "mdns")]
    Mdns,
    #[serde(rename = "tcpholepunch")]
    TcpHolePunch,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mdns" => Ok(StrategyKind::Mdns),
            "tcpholepunch" => Ok(StrategyKind::TcpHolePunch),
            other => Err(format!("unknown strategy {other:?}")),
        }
    }
}

/// Opens a raw stream to one address.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<BoxStream>;
}

/// Plain TCP with a connect timeout.
#[derive(Debug, Clone, Copy)]
pub struct TcpDialer {
    pub timeout: Duration,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<BoxStream> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// Try each address in order; the first stream that opens wins.
pub async fn dial_first(addrs: &[SocketAddr], dialer: &dyn Dialer) -> Option<BoxStream> {
    for addr in addrs {
        match dialer.dial(*addr).await {
            Ok(stream) => {
                debug!("connected to {}", addr);
                return Some(stream);
            }
            Err(e) => debug!("dial {} failed: {}", addr, e),
        }
    }
    None
}

/// Look the peer up over discovery, dial its addresses (IPv4 first), optionally upgrade to TLS.
pub struct MdnsStrategy {
    discovery: Arc<dyn Discovery>,
    dialer: Arc<dyn Dialer>,
    lookup_timeout: Duration,
    tls: Option<TlsConnector>,
}

impl MdnsStrategy {
    pub fn new(
        discovery: Arc<dyn Discovery>,
        dialer: Arc<dyn Dialer>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            discovery,
            dialer,
            lookup_timeout,
            tls: None,
        }
    }

    pub fn with_tls(mut self, connector: TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }
}

#[async_trait]
impl ConnectionStrategy for MdnsStrategy {
    async fn connect(&self, peer: &str) -> Result<Connection> {
        let address = self.discovery.lookup(peer, self.lookup_timeout).await?;
        let candidates = address.candidates();
        let stream = dial_first(&candidates, self.dialer.as_ref())
            .await
            .ok_or_else(|| DropError::NoAddressReachable(peer.to_string()))?;

        let Some(connector) = &self.tls else {
            return Ok(Connection {
                stream,
                encrypted: false,
                peer: peer.to_string(),
            });
        };
        let name = tls::server_name(address.droplet().unwrap_or(&address.host))?;
        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| DropError::Tls(e.to_string()))?;
        info!("tls established with {}", peer);
        Ok(Connection {
            stream: Box::new(stream),
            encrypted: true,
            peer: peer.to_string(),
        })
    }
}

pub struct HolePunchStrategy {
    traversal: Arc<dyn Traversal>,
    config: HolePunchConfig,
}

impl HolePunchStrategy {
    pub fn new(traversal: Arc<dyn Traversal>, config: HolePunchConfig) -> Self {
        Self { traversal, config }
    }
}

#[async_trait]
impl ConnectionStrategy for HolePunchStrategy {
    async fn connect(&self, peer: &str) -> Result<Connection> {
        let stream = self.traversal.punch(peer, &self.config).await?;
        Ok(Connection {
            stream,
            encrypted: false,
            peer: peer.to_string(),
        })
    }
}

/// Resolve the configured strategy. `uid` names this node to a hole-punch relay.
pub fn build(config: &Config, uid: &str) -> Result<Arc<dyn ConnectionStrategy>> {
    match config.strategy {
        StrategyKind::Mdns => {
            let discovery = Arc::new(MdnsDiscovery::new(config.service_name.clone())?);
            let dialer = Arc::new(TcpDialer {
                timeout: config.connect_timeout(),
            });
            let mut strategy = MdnsStrategy::new(discovery, dialer, config.discovery_timeout());
            if let Some(root_ca) = &config.tls.root_ca {
                strategy = strategy.with_tls(tls::client_connector(root_ca)?);
            }
            Ok(Arc::new(strategy))
        }
        StrategyKind::TcpHolePunch => {
            let relay = config.holepunch.relay.clone().ok_or_else(|| {
                DropError::Config("strategy tcpholepunch needs holepunch.relay".into())
            })?;
            let listen = config.holepunch.listen.parse().map_err(|_| {
                DropError::Config(format!(
                    "holepunch.listen {:?} is not a socket address",
                    config.holepunch.listen
                ))
            })?;
            let punch = HolePunchConfig {
                relay,
                listen,
                uid: uid.to_string(),
                timeout: config.connect_timeout(),
            };
            Ok(Arc::new(HolePunchStrategy::new(
                Arc::new(RelayTraversal),
                punch,
            )))
        }
    }
}
