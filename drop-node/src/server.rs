//! Accept loop: one task per inbound connection, each running the packet loop over a Session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use drop_core::{Keypair, Packet};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::clone::{Grant, Share};
use crate::error::{DropError, Result};
use crate::session::{Incoming, Session};
use crate::strategy::BoxStream;

/// How accepted streams are upgraded before a Session is built on them.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl Acceptor {
    /// Returns the stream and whether it is encrypted.
    pub async fn upgrade(&self, stream: TcpStream) -> Result<(BoxStream, bool)> {
        match self {
            Acceptor::Plain => Ok((Box::new(stream), false)),
            Acceptor::Tls(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| DropError::Tls(e.to_string()))?;
                Ok((Box::new(stream), true))
            }
        }
    }
}

pub struct Listener {
    inner: TcpListener,
    acceptor: Acceptor,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, acceptor: Acceptor) -> Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Next raw TCP stream. The TLS upgrade is left to the connection's own task.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((stream, addr))
    }

    pub fn acceptor(&self) -> &Acceptor {
        &self.acceptor
    }
}

pub struct Server {
    listener: Listener,
    share: Arc<Share>,
    local_name: String,
    keypair: Option<Arc<Keypair>>,
}

impl Server {
    pub fn new(listener: Listener, share: Share, local_name: impl Into<String>) -> Self {
        Self {
            listener,
            share: Arc::new(share),
            local_name: local_name.into(),
            keypair: None,
        }
    }

    /// Answer key exchanges with `keypair`. Without one they fail with `NoKeyPairConfigured`.
    pub fn with_keypair(mut self, keypair: Arc<Keypair>) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` resolves. Connections already running are left to finish.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(
            "sharing {} on {}",
            self.share.root().display(),
            self.listener.local_addr()?
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("connection from {}", addr);
                        let acceptor = self.listener.acceptor().clone();
                        let share = self.share.clone();
                        let keypair = self.keypair.clone();
                        let local_name = self.local_name.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, acceptor, share, keypair, local_name)
                                .await;
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Acceptor,
    share: Arc<Share>,
    keypair: Option<Arc<Keypair>>,
    local_name: String,
) {
    let (stream, encrypted) = match acceptor.upgrade(stream).await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            error!("tls handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let mut session = Session::from_stream(stream, encrypted, local_name);
    if let Some(keypair) = keypair {
        session = session.with_keypair(keypair);
    }
    match run_session(session, &share).await {
        Ok(()) => debug!("{} done", addr),
        Err(e) => error!("connection from {}: {}", addr, e),
    }
}

/// Serve one peer until it disconnects or a transfer completes.
pub async fn run_session(mut session: Session, share: &Share) -> Result<()> {
    loop {
        let incoming = match session.read_packet().await {
            Ok(incoming) => incoming,
            Err(e) if e.is_disconnect() => return Ok(()),
            Err(e) => return Err(e),
        };
        match incoming {
            Incoming::Handshake(frame) => {
                session.respond_key_exchange(frame).await?;
            }
            Incoming::Packet(Packet::Auth { name }) => {
                let header = share.header().await?;
                session.answer_auth(name, &header).await?;
            }
            Incoming::Packet(Packet::Clone) => match share.grant(session).await? {
                Grant::Denied(returned) => session = returned,
                Grant::Transferred(_) => return Ok(()),
            },
            Incoming::Packet(Packet::Unknown(tag)) => debug!("ignoring packet type {}", tag),
        }
    }
}
