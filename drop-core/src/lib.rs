//! Drop protocol reference implementation.
//! Pure: framing, packet layouts, entry headers and identities. No I/O.

pub mod header;
pub mod identity;
pub mod path;
pub mod protocol;
pub mod wire;

pub use header::{decode_header, EntryHeader, HeaderError};
pub use identity::{DeviceId, Keypair, PublicKey};
pub use path::UnsafePath;
pub use protocol::{CloneReply, ContentHeader, Packet, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FieldError, Frame, FrameError};
