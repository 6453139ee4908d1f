//! One stream to one peer: key exchange, authentication, clone gating and the transfer itself.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use drop_core::identity::session_fingerprint;
use drop_core::protocol::{
    AUTH_RESPONSE_LENGTH, CLONE_ACKNACK_LENGTH, HANDSHAKE, HANDSHAKE_ACK, HANDSHAKE_OK,
    HANDSHAKE_SYN_ACK, PACKET_BODY_LENGTH,
};
use drop_core::wire::{self, decode_frame, encode_frame, Frame};
use drop_core::{CloneReply, ContentHeader, Keypair, Packet, PublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

use crate::codec::{TransferCodec, TransferStats};
use crate::error::{DropError, Result};
use crate::strategy::{BoxStream, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    KeyExchanged,
    Authenticated,
    Transferring,
    /// A handshake failed; every later operation fails too.
    Failed,
    Closed,
}

/// What the serving side read off the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Handshake(Frame),
    Packet(Packet),
}

type Reader = BufReader<ReadHalf<BoxStream>>;
type Writer = BufWriter<WriteHalf<BoxStream>>;

pub struct Session {
    reader: Reader,
    writer: Writer,
    keypair: Option<Arc<Keypair>>,
    encrypted: bool,
    authenticated: bool,
    local_name: String,
    remote_name: Option<String>,
    remote_key: Option<PublicKey>,
    state: SessionState,
}

fn join_err(e: tokio::task::JoinError) -> DropError {
    DropError::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn is_frame_tag(tag: u8) -> bool {
    matches!(tag, HANDSHAKE | HANDSHAKE_SYN_ACK | HANDSHAKE_ACK)
}

impl Session {
    pub fn new(connection: Connection, local_name: impl Into<String>) -> Self {
        let mut session = Self::from_stream(connection.stream, connection.encrypted, local_name);
        session.remote_name = Some(connection.peer);
        session
    }

    pub fn from_stream(stream: BoxStream, encrypted: bool, local_name: impl Into<String>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: BufWriter::new(write),
            keypair: None,
            encrypted,
            authenticated: false,
            local_name: local_name.into(),
            remote_name: None,
            remote_key: None,
            state: SessionState::Connected,
        }
    }

    pub fn with_keypair(mut self, keypair: Arc<Keypair>) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    /// Present only after a completed key exchange.
    pub fn remote_key(&self) -> Option<&PublicKey> {
        self.remote_key.as_ref()
    }

    fn peer(&self) -> &str {
        self.remote_name.as_deref().unwrap_or("peer")
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            SessionState::Failed => Err(DropError::HandshakeFailed(
                "session failed an earlier handshake".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Authentication happens once per session.
    fn ensure_unauthenticated(&self) -> Result<()> {
        if self.authenticated {
            return Err(DropError::AuthFailure(format!(
                "{} is already authenticated",
                self.peer()
            )));
        }
        Ok(())
    }

    fn keypair(&self) -> Result<Arc<Keypair>> {
        self.keypair.clone().ok_or(DropError::NoKeyPairConfigured)
    }

    async fn send_frame(&mut self, kind: u8, payload: &[u8]) -> Result<()> {
        self.writer.write_all(&encode_frame(kind, payload)?).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read the rest of a handshake frame whose type byte was already consumed.
    async fn read_frame_after(&mut self, kind: u8) -> Result<Frame> {
        let mut bytes = vec![kind, 0, 0];
        self.reader.read_exact(&mut bytes[1..]).await?;
        let len = wire::declared_len(&bytes).unwrap_or(0);
        bytes.resize(wire::frame_len(len), 0);
        self.reader.read_exact(&mut bytes[3..]).await?;
        let (frame, _) = decode_frame(&bytes)?;
        Ok(frame)
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        let kind = self.reader.read_u8().await?;
        self.read_frame_after(kind).await
    }

    /// Record the outcome of a handshake. Any failure leaves no peer key and a failed session.
    fn settle_handshake(
        &mut self,
        outcome: Result<PublicKey>,
        keypair: &Keypair,
    ) -> Result<PublicKey> {
        match outcome {
            Ok(remote) => {
                info!(
                    "key exchange with {} complete, fingerprint {}",
                    self.peer(),
                    session_fingerprint(keypair, &remote)
                );
                self.remote_key = Some(remote.clone());
                self.state = SessionState::KeyExchanged;
                Ok(remote)
            }
            Err(e) => {
                debug!("key exchange with {} failed: {}", self.peer(), e);
                self.remote_key = None;
                self.state = SessionState::Failed;
                Err(match e {
                    DropError::Frame(e) => DropError::HandshakeFailed(e.to_string()),
                    other => other,
                })
            }
        }
    }

    /// Initiator side: `HANDSHAKE` out, `HANDSHAKE_SYN_ACK` in, `HANDSHAKE_ACK` out.
    pub async fn key_exchange(&mut self) -> Result<PublicKey> {
        self.ensure_usable()?;
        let keypair = self.keypair()?;
        let outcome = self.initiate(&keypair).await;
        self.settle_handshake(outcome, &keypair)
    }

    async fn initiate(&mut self, keypair: &Keypair) -> Result<PublicKey> {
        self.send_frame(HANDSHAKE, keypair.public_key().as_bytes()).await?;
        let reply = self.read_frame().await?;
        if reply.kind != HANDSHAKE_SYN_ACK {
            return Err(DropError::HandshakeFailed(format!(
                "expected frame type {HANDSHAKE_SYN_ACK}, got {}",
                reply.kind
            )));
        }
        let remote = PublicKey::from_slice(&reply.payload).ok_or_else(|| {
            DropError::HandshakeFailed(format!("{}-byte public key", reply.payload.len()))
        })?;
        self.send_frame(HANDSHAKE_ACK, HANDSHAKE_OK).await?;
        Ok(remote)
    }

    /// Responder side, given the `HANDSHAKE` frame the serving loop just read.
    pub async fn respond_key_exchange(&mut self, frame: Frame) -> Result<PublicKey> {
        self.ensure_usable()?;
        let keypair = self.keypair()?;
        let outcome = self.respond(&keypair, frame).await;
        self.settle_handshake(outcome, &keypair)
    }

    async fn respond(&mut self, keypair: &Keypair, frame: Frame) -> Result<PublicKey> {
        if frame.kind != HANDSHAKE {
            return Err(DropError::HandshakeFailed(format!(
                "expected frame type {HANDSHAKE}, got {}",
                frame.kind
            )));
        }
        let remote = PublicKey::from_slice(&frame.payload).ok_or_else(|| {
            DropError::HandshakeFailed(format!("{}-byte public key", frame.payload.len()))
        })?;
        self.remote_key = Some(remote.clone());
        self.send_frame(HANDSHAKE_SYN_ACK, keypair.public_key().as_bytes())
            .await?;
        let ack = self.read_frame().await?;
        if ack.kind != HANDSHAKE_ACK || ack.payload != HANDSHAKE_OK {
            return Err(DropError::HandshakeFailed(format!(
                "expected {HANDSHAKE_ACK} OK, got frame type {}",
                ack.kind
            )));
        }
        Ok(remote)
    }

    /// Requesting side: send our name, read the advisory size and name of the shared content.
    pub async fn authenticate(&mut self) -> Result<ContentHeader> {
        self.ensure_usable()?;
        self.ensure_unauthenticated()?;
        let request = Packet::Auth {
            name: self.local_name.clone(),
        }
        .encode()?;
        self.writer.write_all(&request).await?;
        self.writer.flush().await?;

        let mut response = [0u8; AUTH_RESPONSE_LENGTH];
        self.reader
            .read_exact(&mut response)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => DropError::TruncatedAuthResponse,
                _ => DropError::Io(e),
            })?;
        let header =
            ContentHeader::decode(&response).map_err(|e| DropError::AuthFailure(e.to_string()))?;
        self.authenticated = true;
        self.state = SessionState::Authenticated;
        debug!("authenticated with {}: {:?}", self.peer(), header);
        Ok(header)
    }

    /// Serving side of authentication.
    pub async fn answer_auth(&mut self, peer_name: String, header: &ContentHeader) -> Result<()> {
        self.ensure_usable()?;
        self.ensure_unauthenticated()?;
        self.writer.write_all(&header.encode()?).await?;
        self.writer.flush().await?;
        info!("authenticated {}", peer_name);
        self.remote_name = Some(peer_name);
        self.authenticated = true;
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Serving side: one handshake frame or one tagged 64-byte packet.
    pub async fn read_packet(&mut self) -> Result<Incoming> {
        self.ensure_usable()?;
        let tag = self.reader.read_u8().await?;
        if is_frame_tag(tag) {
            return Ok(Incoming::Handshake(self.read_frame_after(tag).await?));
        }
        let mut body = [0u8; PACKET_BODY_LENGTH];
        self.reader.read_exact(&mut body).await?;
        Ok(Incoming::Packet(Packet::decode(tag, &body)?))
    }

    /// Ask for the shared content. A NAK is `CloneDenied` with the peer's reason.
    pub async fn request_clone(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.writer.write_all(&Packet::Clone.encode()?).await?;
        self.writer.flush().await?;
        let mut reply = [0u8; CLONE_ACKNACK_LENGTH];
        self.reader.read_exact(&mut reply).await?;
        match CloneReply::decode(&reply)? {
            CloneReply::Ack => Ok(()),
            CloneReply::Nak(reason) => Err(DropError::CloneDenied(reason)),
        }
    }

    pub async fn reply_clone(&mut self, reply: &CloneReply) -> Result<()> {
        self.writer.write_all(&reply.encode()?).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Encode `root` onto the stream, then shut the stream down. Consumes the session.
    pub async fn send_tree(
        mut self,
        codec: TransferCodec,
        root: PathBuf,
    ) -> Result<TransferStats> {
        self.ensure_usable()?;
        self.state = SessionState::Transferring;
        let Session { writer, .. } = self;
        let handle = Handle::current();
        let (stats, mut writer) = tokio::task::spawn_blocking(move || {
            let mut out = SyncIoBridge::new_with_handle(writer, handle);
            let stats = codec.encode(&root, &mut out)?;
            out.flush()?;
            Ok::<_, DropError>((stats, out.into_inner()))
        })
        .await
        .map_err(join_err)??;
        writer.shutdown().await?;
        Ok(stats)
    }

    /// Decode the rest of the stream into `dest`. Consumes the session.
    pub async fn receive_tree(
        mut self,
        codec: TransferCodec,
        dest: PathBuf,
    ) -> Result<TransferStats> {
        self.ensure_usable()?;
        self.state = SessionState::Transferring;
        let Session { reader, .. } = self;
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || {
            let mut input = SyncIoBridge::new_with_handle(reader, handle);
            let stats = codec.decode(&mut input, &dest)?;
            // Read whatever trails the last entry so the sender's shutdown is clean.
            match io::copy(&mut input, &mut io::sink()) {
                Ok(0) => {}
                Ok(n) => debug!("discarded {} bytes after the last entry", n),
                Err(e) => debug!("draining after the last entry failed: {}", e),
            }
            Ok::<_, DropError>(stats)
        })
        .await
        .map_err(join_err)?
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read(buf).await?)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).await?;
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Ok(self.writer.write_all(buf).await?)
    }

    pub async fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush().await?)
    }

    /// Flush and shut down the write side, then release the stream.
    pub async fn close(mut self) -> Result<()> {
        self.state = SessionState::Closed;
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}
