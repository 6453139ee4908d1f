//! Framed entry headers: one fixed-width record per directory-tree entry.
//!
//! `[10B size][64B name][1B flags][10B path-len][path-len B path]`

use std::path::Path;

use crate::path::{self, UnsafePath};
use crate::protocol::{NAME_FIELD_LEN, SIZE_FIELD_LEN};
use crate::wire::{self, FieldError};

/// Flag bit: transfer complete, no content follows.
pub const DONE_FLAG: u8 = 1;
/// Flag bit: entry is a directory.
pub const DIR_FLAG: u8 = 2;

pub const PATH_LEN_FIELD_LEN: usize = 10;

/// Longest path a header may carry.
pub const MAX_PATH_LEN: usize = 4096;

/// Bytes before the variable-length path.
pub const HEADER_FIXED_LEN: usize = SIZE_FIELD_LEN + NAME_FIELD_LEN + 1 + PATH_LEN_FIELD_LEN;

const FLAGS_OFFSET: usize = SIZE_FIELD_LEN + NAME_FIELD_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub size: u64,
    pub name: String,
    pub flags: u8,
    /// Relative, `/`-separated path of the entry.
    pub path: String,
}

impl EntryHeader {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        let path = path.into();
        Self {
            size,
            name: file_name(&path),
            flags: 0,
            path,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        let path = path.into();
        let mut header = Self {
            size: 0,
            name: file_name(&path),
            flags: 0,
            path,
        };
        header.set_dir_bit();
        header
    }

    /// End-of-transfer sentinel.
    pub fn done() -> Self {
        let mut header = Self {
            size: 0,
            name: String::new(),
            flags: 0,
            path: String::new(),
        };
        header.set_done_bit();
        header
    }

    pub fn is_dir(&self) -> bool {
        self.flags & DIR_FLAG != 0
    }

    pub fn is_complete(&self) -> bool {
        self.flags & DONE_FLAG != 0
    }

    pub fn set_dir_bit(&mut self) {
        self.flags |= DIR_FLAG;
    }

    pub fn set_done_bit(&mut self) {
        self.flags |= DONE_FLAG;
    }

    pub fn encode(&self) -> Result<Vec<u8>, FieldError> {
        let path = self.path.as_bytes();
        if path.len() > MAX_PATH_LEN {
            return Err(FieldError::Malformed(format!("path length {}", path.len())));
        }
        let mut out = Vec::with_capacity(HEADER_FIXED_LEN + path.len());
        out.extend_from_slice(&wire::encode_number_field(self.size, SIZE_FIELD_LEN)?);
        out.extend_from_slice(&wire::encode_text_field(&self.name, NAME_FIELD_LEN)?);
        out.push(self.flags);
        out.extend_from_slice(&wire::encode_number_field(
            path.len() as u64,
            PATH_LEN_FIELD_LEN,
        )?);
        out.extend_from_slice(path);
        Ok(out)
    }
}

/// Last path segment, cut at a char boundary to fit the name field. The path is authoritative.
fn file_name(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or_default();
    wire::fit_text(name, NAME_FIELD_LEN).to_owned()
}

/// Decode one header from the front of `bytes`. Returns the header and bytes consumed.
/// `Short` carries the total length needed once the path length is known.
pub fn decode_header(bytes: &[u8]) -> Result<(EntryHeader, usize), HeaderError> {
    if bytes.len() < HEADER_FIXED_LEN {
        return Err(HeaderError::Short {
            needed: HEADER_FIXED_LEN,
        });
    }
    let size = wire::decode_number_field(&bytes[..SIZE_FIELD_LEN])?;
    let name = wire::decode_text_field(&bytes[SIZE_FIELD_LEN..FLAGS_OFFSET])?;
    let flags = bytes[FLAGS_OFFSET];
    let path_len = wire::decode_number_field(&bytes[FLAGS_OFFSET + 1..HEADER_FIXED_LEN])?;
    let path_len = usize::try_from(path_len)
        .ok()
        .filter(|len| *len <= MAX_PATH_LEN)
        .ok_or_else(|| FieldError::Malformed(format!("path length {path_len}")))?;
    let total = HEADER_FIXED_LEN + path_len;
    if bytes.len() < total {
        return Err(HeaderError::Short { needed: total });
    }
    let path = std::str::from_utf8(&bytes[HEADER_FIXED_LEN..total])
        .map_err(|e| FieldError::Malformed(format!("path is not utf-8: {e}")))?
        .to_owned();
    let header = EntryHeader {
        size,
        name,
        flags,
        path,
    };
    if !header.is_complete() {
        path::sanitize(Path::new(&header.path))?;
    }
    Ok((header, total))
}

/// Error decoding a framed entry header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("need {needed} header bytes")]
    Short { needed: usize },
    #[error(transparent)]
    Field(#[from] FieldError),
    #[error(transparent)]
    UnsafePath(#[from] UnsafePath),
}
