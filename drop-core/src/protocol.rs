//! Drop wire protocol: packet tags, fixed packet layouts and their codecs.

use crate::wire::{self, FieldError};

/// Advertised protocol version (mDNS `version` metadata).
pub const PROTOCOL_VERSION: &str = "1.0";

pub const AUTH_PACKET: u8 = 60;
pub const CLONE_PACKET: u8 = 61;
pub const CLONE_PACKET_ACK: u8 = 62;
pub const CLONE_PACKET_NAK: u8 = 63;

/// Handshake frame types.
pub const HANDSHAKE: u8 = 66;
pub const HANDSHAKE_SYN_ACK: u8 = 67;
pub const HANDSHAKE_ACK: u8 = 68;

/// Payload of the final `HANDSHAKE_ACK` frame.
pub const HANDSHAKE_OK: &[u8] = b"OK";

pub const NAME_FIELD_LEN: usize = 64;
pub const SIZE_FIELD_LEN: usize = 10;

/// Every tagged request packet: 1 tag byte + 64-byte body.
pub const PACKET_LENGTH: usize = 1 + NAME_FIELD_LEN;
pub const PACKET_BODY_LENGTH: usize = NAME_FIELD_LEN;
pub const CLONE_ACKNACK_LENGTH: usize = PACKET_LENGTH;
pub const AUTH_RESPONSE_LENGTH: usize = SIZE_FIELD_LEN + NAME_FIELD_LEN;

/// Copy chunk size for entry content.
pub const BUF_SIZE: usize = 1024;

/// NAK reason sent to a peer that asks to clone before authenticating.
pub const NOT_AUTHENTICATED: &str = "Not Authenticated";

/// A tagged request packet read by the serving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Auth { name: String },
    Clone,
    Unknown(u8),
}

impl Packet {
    /// Decode a packet from its tag and 64-byte body.
    pub fn decode(tag: u8, body: &[u8]) -> Result<Packet, FieldError> {
        Ok(match tag {
            AUTH_PACKET => Packet::Auth {
                name: wire::decode_text_field(body)?,
            },
            // The body of a clone request is padding and is ignored.
            CLONE_PACKET => Packet::Clone,
            other => Packet::Unknown(other),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FieldError> {
        match self {
            Packet::Auth { name } => tagged(AUTH_PACKET, name),
            Packet::Clone => tagged(CLONE_PACKET, ""),
            Packet::Unknown(tag) => tagged(*tag, ""),
        }
    }
}

fn tagged(tag: u8, body: &str) -> Result<Vec<u8>, FieldError> {
    let mut out = Vec::with_capacity(PACKET_LENGTH);
    out.push(tag);
    out.extend_from_slice(&wire::encode_text_field(body, NAME_FIELD_LEN)?);
    Ok(out)
}

/// Authentication response: advisory total size and name of the shared content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub size: u64,
    pub name: String,
}

impl ContentHeader {
    pub fn encode(&self) -> Result<Vec<u8>, FieldError> {
        let mut out = wire::encode_number_field(self.size, SIZE_FIELD_LEN)?;
        out.extend_from_slice(&wire::encode_text_field(&self.name, NAME_FIELD_LEN)?);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<ContentHeader, FieldError> {
        if bytes.len() != AUTH_RESPONSE_LENGTH {
            return Err(FieldError::Malformed(format!(
                "auth response of {} bytes",
                bytes.len()
            )));
        }
        Ok(ContentHeader {
            size: wire::decode_number_field(&bytes[..SIZE_FIELD_LEN])?,
            name: wire::decode_text_field(&bytes[SIZE_FIELD_LEN..])?,
        })
    }
}

/// Answer to a clone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneReply {
    Ack,
    Nak(String),
}

impl CloneReply {
    pub fn encode(&self) -> Result<Vec<u8>, FieldError> {
        match self {
            CloneReply::Ack => tagged(CLONE_PACKET_ACK, ""),
            CloneReply::Nak(reason) => tagged(CLONE_PACKET_NAK, reason),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<CloneReply, FieldError> {
        if bytes.len() != CLONE_ACKNACK_LENGTH {
            return Err(FieldError::Malformed(format!(
                "clone reply of {} bytes",
                bytes.len()
            )));
        }
        match bytes[0] {
            CLONE_PACKET_ACK => Ok(CloneReply::Ack),
            CLONE_PACKET_NAK => Ok(CloneReply::Nak(wire::decode_text_field(&bytes[1..])?)),
            other => Err(FieldError::Malformed(format!(
                "unexpected clone reply tag {other}"
            ))),
        }
    }
}
