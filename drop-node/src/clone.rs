//! Clone protocol: the granting side gates on authentication, the requesting side drives a
//! whole clone from peer name to files on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use drop_core::protocol::{NAME_FIELD_LEN, NOT_AUTHENTICATED};
use drop_core::wire;
use drop_core::{CloneReply, ContentHeader, Keypair};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::codec::{TransferCodec, TransferStats};
use crate::error::{DropError, Result};
use crate::session::Session;
use crate::strategy::ConnectionStrategy;

/// Sum of regular-file sizes under `root`. Entries that vanish or cannot be read count as zero.
pub fn content_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// A directory offered to peers.
#[derive(Debug, Clone)]
pub struct Share {
    root: PathBuf,
    name: String,
    codec: TransferCodec,
}

/// Outcome of a clone request on the granting side.
pub enum Grant {
    /// Not authenticated: NAK sent, the session goes back to the packet loop.
    Denied(Session),
    Transferred(TransferStats),
}

impl Share {
    pub fn new(root: impl Into<PathBuf>, codec: TransferCodec) -> Result<Self> {
        let root = root.into();
        let meta = std::fs::metadata(&root).map_err(DropError::fs(&root))?;
        if !meta.is_dir() {
            return Err(DropError::FileSystem {
                path: root,
                source: std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            });
        }
        let name = root
            .file_name()
            .map(|n| wire::fit_text(&n.to_string_lossy(), NAME_FIELD_LEN).to_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "drop".to_string());
        Ok(Self { root, name, codec })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> TransferCodec {
        self.codec
    }

    /// Authentication response for this share. The size is recomputed on every call.
    pub async fn header(&self) -> Result<ContentHeader> {
        let root = self.root.clone();
        let size = tokio::task::spawn_blocking(move || content_size(&root))
            .await
            .map_err(|e| DropError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(ContentHeader {
            size,
            name: self.name.clone(),
        })
    }

    /// Answer a clone request. The session is consumed when the transfer runs.
    pub async fn grant(&self, mut session: Session) -> Result<Grant> {
        if !session.is_authenticated() {
            debug!("refusing clone to unauthenticated peer");
            session
                .reply_clone(&CloneReply::Nak(NOT_AUTHENTICATED.to_string()))
                .await?;
            return Ok(Grant::Denied(session));
        }
        let peer = session.remote_name().unwrap_or("peer").to_string();
        session.reply_clone(&CloneReply::Ack).await?;
        info!("sending {} to {}", self.root.display(), peer);
        let stats = session.send_tree(self.codec, self.root.clone()).await?;
        info!(
            "sent {} files, {} directories, {} bytes to {}",
            stats.files, stats.dirs, stats.bytes, peer
        );
        Ok(Grant::Transferred(stats))
    }
}

/// Result of a completed clone.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    pub header: ContentHeader,
    pub stats: TransferStats,
    pub encrypted: bool,
}

/// Requesting side: connect, optionally exchange keys, authenticate, request, receive.
pub struct Requester {
    strategy: Arc<dyn ConnectionStrategy>,
    local_name: String,
    codec: TransferCodec,
    keypair: Option<Arc<Keypair>>,
    handshake: bool,
}

impl Requester {
    pub fn new(
        strategy: Arc<dyn ConnectionStrategy>,
        local_name: impl Into<String>,
        codec: TransferCodec,
    ) -> Self {
        Self {
            strategy,
            local_name: local_name.into(),
            codec,
            keypair: None,
            handshake: false,
        }
    }

    /// Run the key exchange with `keypair` before authenticating.
    pub fn with_handshake(mut self, keypair: Arc<Keypair>) -> Self {
        self.keypair = Some(keypair);
        self.handshake = true;
        self
    }

    pub async fn clone_into(&self, peer: &str, dest: &Path) -> Result<CloneOutcome> {
        let connection = self.strategy.connect(peer).await?;
        let mut session = Session::new(connection, self.local_name.clone());
        let encrypted = session.is_encrypted();
        if let Some(keypair) = &self.keypair {
            session = session.with_keypair(keypair.clone());
        }
        if self.handshake {
            session.key_exchange().await?;
        }
        let header = session.authenticate().await?;
        info!("{} offers {:?} ({} bytes)", peer, header.name, header.size);
        session.request_clone().await?;
        let stats = session.receive_tree(self.codec, dest.to_path_buf()).await?;
        if stats.bytes != header.size {
            warn!(
                "received {} bytes, {} were announced",
                stats.bytes, header.size
            );
        }
        Ok(CloneOutcome {
            header,
            stats,
            encrypted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::BoxStream;
    use drop_core::protocol::{CLONE_PACKET_ACK, CLONE_PACKET_NAK};
    use std::fs;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn share_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir_all(dir.path().join("sub/empty")).unwrap();
        fs::write(dir.path().join("sub/b.bin"), vec![7u8; 100]).unwrap();
        fs::write(dir.path().join("sub/zero"), b"").unwrap();
        dir
    }

    fn serving(stream: DuplexStream) -> Session {
        let stream: BoxStream = Box::new(stream);
        Session::from_stream(stream, false, "alice.drop.local")
    }

    #[test]
    fn size_sums_regular_files() {
        let dir = share_dir();
        assert_eq!(content_size(dir.path()), 105);
        assert_eq!(content_size(&dir.path().join("missing")), 0);
    }

    #[test]
    fn share_must_be_a_directory() {
        let dir = share_dir();
        assert!(Share::new(dir.path().join("a.txt"), TransferCodec::Tar).is_err());
        assert!(Share::new(dir.path().join("missing"), TransferCodec::Tar).is_err());
        let share = Share::new(dir.path().join("sub"), TransferCodec::Tar).unwrap();
        assert_eq!(share.name(), "sub");
    }

    #[tokio::test]
    async fn header_reports_size_and_name() {
        let dir = share_dir();
        let share = Share::new(dir.path(), TransferCodec::TarGzip).unwrap();
        let header = share.header().await.unwrap();
        assert_eq!(header.size, 105);
        assert_eq!(header.name, share.name());
    }

    #[tokio::test]
    async fn long_directory_names_still_answer_auth() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("d".repeat(80));
        fs::create_dir(&root).unwrap();
        fs::write(root.join("f"), b"abc").unwrap();

        let share = Share::new(&root, TransferCodec::Tar).unwrap();
        assert_eq!(share.name(), "d".repeat(NAME_FIELD_LEN));
        let header = share.header().await.unwrap();
        let bytes = header.encode().unwrap();
        assert_eq!(ContentHeader::decode(&bytes).unwrap(), header);
    }

    #[tokio::test]
    async fn unauthenticated_clone_is_refused() {
        let dir = share_dir();
        let share = Share::new(dir.path(), TransferCodec::Tar).unwrap();
        let (ours, mut peer) = tokio::io::duplex(4096);

        let Grant::Denied(mut session) = share.grant(serving(ours)).await.unwrap() else {
            panic!("clone granted without authentication");
        };
        let mut reply = [0u8; 65];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], CLONE_PACKET_NAK);
        assert_eq!(wire::decode_text_field(&reply[1..]).unwrap(), NOT_AUTHENTICATED);

        // The connection stays usable.
        peer.write_all(&drop_core::Packet::Clone.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(
            session.read_packet().await.unwrap(),
            crate::session::Incoming::Packet(drop_core::Packet::Clone)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn authenticated_clone_acks_then_streams() {
        let dir = share_dir();
        let share = Share::new(dir.path(), TransferCodec::Tar).unwrap();
        let (ours, mut peer) = tokio::io::duplex(1 << 16);
        let mut session = serving(ours);
        let header = share.header().await.unwrap();
        session.answer_auth("bob".into(), &header).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut bytes = Vec::new();
            peer.read_to_end(&mut bytes).await.unwrap();
            bytes
        });
        let Grant::Transferred(stats) = share.grant(session).await.unwrap() else {
            panic!("authenticated clone refused");
        };
        assert_eq!(stats.files, 3);
        assert_eq!(stats.bytes, 105);

        let bytes = reader.await.unwrap();
        assert_eq!(&bytes[..74], &header.encode().unwrap()[..]);
        assert_eq!(bytes[74], CLONE_PACKET_ACK);
        assert!(bytes[75..74 + 65].iter().all(|b| *b == wire::FILLER));

        let dest = tempfile::tempdir().unwrap();
        TransferCodec::Tar
            .decode(&bytes[74 + 65..], dest.path())
            .unwrap();
        assert_eq!(fs::read(dest.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dest.path().join("sub/b.bin")).unwrap(), vec![7u8; 100]);
        assert!(dest.path().join("sub/empty").is_dir());
    }
}
