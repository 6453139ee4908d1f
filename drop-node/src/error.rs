//! Error taxonomy for everything above the pure protocol crate.

use std::io;
use std::path::PathBuf;

use drop_core::{FieldError, FrameError, HeaderError, UnsafePath};

#[derive(Debug, thiserror::Error)]
pub enum DropError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("service {0:?} not found")]
    ServiceNotFound(String),
    #[error("no address of {0:?} was reachable")]
    NoAddressReachable(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("no key pair configured for the handshake")]
    NoKeyPairConfigured,
    #[error("authentication response was truncated")]
    TruncatedAuthResponse,
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("clone denied: {0}")]
    CloneDenied(String),
    #[error("transfer ended in the middle of an entry")]
    TruncatedTransfer,
    #[error(transparent)]
    UnsafePath(#[from] UnsafePath),
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("{}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("tls: {0}")]
    Tls(String),
    #[error("hole punch: {0}")]
    Traversal(String),
    #[error("config: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DropError>;

impl From<HeaderError> for DropError {
    fn from(e: HeaderError) -> Self {
        match e {
            // A header cut short on the stream is a truncated transfer.
            HeaderError::Short { .. } => DropError::TruncatedTransfer,
            HeaderError::Field(e) => DropError::Field(e),
            HeaderError::UnsafePath(e) => DropError::UnsafePath(e),
        }
    }
}

impl DropError {
    pub(crate) fn fs(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> DropError {
        let path = path.into();
        move |source| DropError::FileSystem { path, source }
    }

    /// Stream read errors: an early EOF means the peer stopped mid-entry.
    pub(crate) fn stream(e: io::Error) -> DropError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DropError::TruncatedTransfer
        } else {
            DropError::Io(e)
        }
    }

    /// True when the peer simply went away (EOF or reset).
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            DropError::Io(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            )
        )
    }
}
