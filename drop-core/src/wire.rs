//! Framing: fixed-width filler-padded fields and type-tagged handshake frames.

/// Padding byte for fixed-width fields. Never occurs at the end of legitimate content.
pub const FILLER: u8 = b'/';

/// Terminator closing every handshake frame.
pub const END_OF_TEXT: u8 = 0x03;

const FRAME_HEAD_SIZE: usize = 3; // type + 2 bytes BE length
const FRAME_OVERHEAD: usize = FRAME_HEAD_SIZE + 1;

/// Largest payload a frame can declare.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Encode text into exactly `width` bytes, right-padded with [`FILLER`].
pub fn encode_text_field(value: &str, width: usize) -> Result<Vec<u8>, FieldError> {
    if value.as_bytes().last() == Some(&FILLER) {
        return Err(FieldError::Malformed(format!(
            "{value:?} ends with the padding character"
        )));
    }
    pad(value.as_bytes(), width)
}

/// Longest prefix of `value` that encodes into a `width`-byte text field: cut at a char
/// boundary, trailing filler dropped.
pub fn fit_text(value: &str, width: usize) -> &str {
    let mut end = value.len().min(width);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].trim_end_matches(FILLER as char)
}

/// Encode an unsigned integer as decimal text in exactly `width` bytes.
pub fn encode_number_field(value: u64, width: usize) -> Result<Vec<u8>, FieldError> {
    pad(value.to_string().as_bytes(), width)
}

fn pad(bytes: &[u8], width: usize) -> Result<Vec<u8>, FieldError> {
    if bytes.len() > width {
        return Err(FieldError::TooLong {
            len: bytes.len(),
            width,
        });
    }
    let mut out = Vec::with_capacity(width);
    out.extend_from_slice(bytes);
    out.resize(width, FILLER);
    Ok(out)
}

fn trim_filler(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != FILLER)
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Decode a padded text field. Only trailing filler is stripped.
pub fn decode_text_field(bytes: &[u8]) -> Result<String, FieldError> {
    std::str::from_utf8(trim_filler(bytes))
        .map(str::to_owned)
        .map_err(|e| FieldError::Malformed(format!("text field is not utf-8: {e}")))
}

/// Decode a padded decimal field.
pub fn decode_number_field(bytes: &[u8]) -> Result<u64, FieldError> {
    let digits = trim_filler(bytes);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(FieldError::Malformed(format!(
            "numeric field {:?}",
            String::from_utf8_lossy(bytes)
        )));
    }
    // All ASCII digits, so only overflow can fail here.
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FieldError::Malformed("numeric field overflows u64".into()))
}

/// Error encoding or decoding a fixed-width field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("field value of {len} bytes does not fit in {width}")]
    TooLong { len: usize, width: usize },
    #[error("malformed field: {0}")]
    Malformed(String),
}

/// A decoded handshake frame. The type byte is not interpreted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Encode `[kind][len_hi][len_lo][payload][END_OF_TEXT]`.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.push(END_OF_TEXT);
    Ok(out)
}

/// Payload length declared by a frame head, or `None` if fewer than 3 bytes are given.
pub fn declared_len(head: &[u8]) -> Option<usize> {
    if head.len() < FRAME_HEAD_SIZE {
        return None;
    }
    Some(u16::from_be_bytes([head[1], head[2]]) as usize)
}

/// Total bytes on the wire for a frame carrying `payload_len` bytes.
pub fn frame_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + payload_len
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    let len = declared_len(bytes).ok_or(FrameError::ShortFrame {
        needed: FRAME_OVERHEAD,
        available: bytes.len(),
    })?;
    let total = frame_len(len);
    if bytes.len() < total {
        return Err(FrameError::ShortFrame {
            needed: total,
            available: bytes.len(),
        });
    }
    let terminator = bytes[total - 1];
    if terminator != END_OF_TEXT {
        return Err(FrameError::MissingTerminator(terminator));
    }
    let frame = Frame {
        kind: bytes[0],
        payload: bytes[FRAME_HEAD_SIZE..total - 1].to_vec(),
    };
    Ok((frame, total))
}

/// Error encoding or decoding a handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("short frame: need {needed} bytes, have {available}")]
    ShortFrame { needed: usize, available: usize },
    #[error("frame payload of {0} bytes too large")]
    TooLarge(usize),
    #[error("frame terminator missing (found {0:#04x})")]
    MissingTerminator(u8),
}
