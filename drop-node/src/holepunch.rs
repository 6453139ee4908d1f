//! Relay-assisted TCP hole punching.
//!
//! The client registers with a rendezvous relay from a reusable local port, learns the
//! peer's public address, then listens on and dials from that same port until either
//! side of the simultaneous open succeeds.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{DropError, Result};
use crate::strategy::BoxStream;

/// Pause between dial attempts while the peer is still opening its side.
const REDIAL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct HolePunchConfig {
    /// Relay `host:port`.
    pub relay: String,
    /// Local address to punch from; port 0 picks one.
    pub listen: SocketAddr,
    /// Our name at the relay.
    pub uid: String,
    pub timeout: Duration,
}

/// NAT traversal collaborator used by the hole-punch strategy.
#[async_trait]
pub trait Traversal: Send + Sync {
    async fn punch(&self, peer: &str, config: &HolePunchConfig) -> Result<BoxStream>;
}

/// Relay reply to `CONNECT <uid> <peer>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayReply {
    Peer(SocketAddr),
    Err(String),
}

impl RelayReply {
    pub fn parse(line: &str) -> Result<RelayReply> {
        let line = line.trim_end_matches(['\r', '\n']);
        if let Some(addr) = line.strip_prefix("PEER ") {
            addr.trim()
                .parse()
                .map(RelayReply::Peer)
                .map_err(|_| DropError::Traversal(format!("bad peer address {addr:?}")))
        } else if let Some(reason) = line.strip_prefix("ERR ") {
            Ok(RelayReply::Err(reason.to_string()))
        } else {
            Err(DropError::Traversal(format!("unexpected relay reply {line:?}")))
        }
    }
}

fn reusable_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RelayTraversal;

impl RelayTraversal {
    /// Ask the relay for the peer's address. Returns it with the local address used.
    async fn rendezvous(
        &self,
        peer: &str,
        config: &HolePunchConfig,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let relay = tokio::net::lookup_host(&config.relay)
            .await?
            .find(|a| a.is_ipv4() == config.listen.is_ipv4())
            .ok_or_else(|| {
                DropError::Traversal(format!("relay {} did not resolve", config.relay))
            })?;
        let stream = reusable_socket(config.listen)?.connect(relay).await?;
        let local = stream.local_addr()?;
        debug!("registered with relay {} from {}", relay, local);

        let (read, mut write) = stream.into_split();
        write
            .write_all(format!("CONNECT {} {}\n", config.uid, peer).as_bytes())
            .await?;
        write.flush().await?;
        let mut line = String::new();
        if BufReader::new(read).read_line(&mut line).await? == 0 {
            return Err(DropError::Traversal("relay closed the connection".into()));
        }
        match RelayReply::parse(&line)? {
            RelayReply::Peer(addr) => Ok((addr, local)),
            RelayReply::Err(reason) => Err(DropError::Traversal(reason)),
        }
    }
}

#[async_trait]
impl Traversal for RelayTraversal {
    async fn punch(&self, peer: &str, config: &HolePunchConfig) -> Result<BoxStream> {
        let deadline = Instant::now() + config.timeout;
        let (remote, local) = tokio::time::timeout_at(deadline, self.rendezvous(peer, config))
            .await
            .map_err(|_| DropError::Traversal("relay did not answer in time".into()))??;

        let listener = reusable_socket(local)?.listen(1)?;
        let dial = async {
            loop {
                match reusable_socket(local)?.connect(remote).await {
                    Ok(stream) => return Ok::<TcpStream, io::Error>(stream),
                    Err(e) => {
                        debug!("dial {} from {}: {}", remote, local, e);
                        tokio::time::sleep(REDIAL_INTERVAL).await;
                    }
                }
            }
        };
        let stream = tokio::select! {
            accepted = listener.accept() => accepted?.0,
            dialed = dial => dialed?,
            _ = tokio::time::sleep_until(deadline) => {
                return Err(DropError::Traversal(format!("no path to {peer} at {remote}")));
            }
        };
        let _ = stream.set_nodelay(true);
        info!("hole punched to {} at {}", peer, remote);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn relay_replies() {
        assert_eq!(
            RelayReply::parse("PEER 10.0.0.5:4100\n").unwrap(),
            RelayReply::Peer("10.0.0.5:4100".parse().unwrap())
        );
        assert_eq!(
            RelayReply::parse("ERR unknown peer\r\n").unwrap(),
            RelayReply::Err("unknown peer".into())
        );
        assert!(RelayReply::parse("PEER nowhere").is_err());
        assert!(RelayReply::parse("HELLO").is_err());
    }

    fn config(relay: SocketAddr, uid: &str) -> HolePunchConfig {
        HolePunchConfig {
            relay: relay.to_string(),
            listen: "127.0.0.1:0".parse().unwrap(),
            uid: uid.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Pairs two registrations and hands each the other's observed address.
    async fn fake_relay(listener: TcpListener) {
        let mut seen = Vec::new();
        for _ in 0..2 {
            let (stream, addr) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("CONNECT "));
            seen.push((reader.into_inner(), addr));
        }
        let (mut a, a_addr) = seen.remove(0);
        let (mut b, b_addr) = seen.remove(0);
        a.write_all(format!("PEER {b_addr}\n").as_bytes()).await.unwrap();
        b.write_all(format!("PEER {a_addr}\n").as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn punches_through_relay_on_loopback() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(fake_relay(relay));

        let alice_config = config(relay_addr, "alice");
        let bob_config = config(relay_addr, "bob");
        let (alice, bob) = tokio::join!(
            RelayTraversal.punch("bob", &alice_config),
            RelayTraversal.punch("alice", &bob_config),
        );
        let mut alice = alice.unwrap();
        let mut bob = bob.unwrap();
        alice.write_all(b"ping").await.unwrap();
        alice.flush().await.unwrap();
        let mut buf = [0u8; 4];
        bob.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn relay_error_is_a_traversal_error() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = relay.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"ERR unknown peer\n").await.unwrap();
        });
        let err = RelayTraversal
            .punch("nobody", &config(relay_addr, "alice"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DropError::Traversal(reason) if reason == "unknown peer"));
    }
}
