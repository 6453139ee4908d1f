//! Drop host: LAN discovery, connection strategies, sessions, the clone protocol and the
//! serving loop. The `drop` binary is a thin CLI over this library.

pub mod clone;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod holepunch;
pub mod server;
pub mod session;
pub mod strategy;
pub mod tls;

pub use clone::{content_size, CloneOutcome, Grant, Requester, Share};
pub use codec::{TransferCodec, TransferStats};
pub use config::Config;
pub use discovery::{Discovery, MdnsDiscovery, PeerAddress};
pub use error::{DropError, Result};
pub use server::{Acceptor, Listener, Server};
pub use session::{Incoming, Session, SessionState};
pub use strategy::{BoxStream, Connection, ConnectionStrategy, StrategyKind};
