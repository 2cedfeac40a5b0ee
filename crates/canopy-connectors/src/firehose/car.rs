//! CAR v1 block archives.
//!
//! A commit's `blocks` field is a CAR file:
//!
//! ```text
//! varint(header_len) | cbor header {version: 1, roots: [...]}
//! varint(section_len) | cid | block bytes
//! varint(section_len) | cid | block bytes
//! ...
//! ```
//!
//! [`BlockIndex`] parses the archive once and lets callers fetch block
//! bytes by CID. Record extraction on top of it is best-effort.

use std::collections::HashMap;

use super::cbor::{decode_prefix, CborError, DecodeLimits, Value};
use super::cid::{read_varint, Cid, CidError};

/// Errors produced while reading a CAR archive.
#[derive(Debug, thiserror::Error)]
pub enum CarError {
    /// A varint or CID was malformed or cut short.
    #[error("car framing: {0}")]
    Framing(#[from] CidError),

    /// A length prefix points past the end of the archive.
    #[error("section at byte {offset} overruns archive ({len} bytes declared)")]
    Overrun {
        /// Offset of the section's length prefix.
        offset: usize,
        /// Declared section length.
        len: u64,
    },

    /// The header is not valid CBOR.
    #[error("car header: {0}")]
    Header(#[from] CborError),

    /// The header declares a version other than 1.
    #[error("unsupported car version {0:?}")]
    UnsupportedVersion(Option<i64>),
}

/// Blocks of one CAR archive, addressable by CID.
#[derive(Debug, Clone, Default)]
pub struct BlockIndex<'a> {
    blocks: HashMap<Cid, &'a [u8]>,
}

impl<'a> BlockIndex<'a> {
    /// Parses every section of `car`. Block bytes are borrowed, not copied.
    ///
    /// # Errors
    ///
    /// Returns a [`CarError`] if the framing or header is invalid.
    pub fn parse(car: &'a [u8], limits: &DecodeLimits) -> Result<Self, CarError> {
        let (header_len, mut pos) = read_section_len(car, 0)?;
        let header_end = pos + header_len;
        let (header, _) = decode_prefix(&car[pos..header_end], limits)?;
        let version = header.get("version").and_then(Value::as_i64);
        if version != Some(1) {
            return Err(CarError::UnsupportedVersion(version));
        }
        pos = header_end;

        let mut blocks = HashMap::new();
        while pos < car.len() {
            let (section_len, start) = read_section_len(car, pos)?;
            let section = &car[start..start + section_len];
            let (cid, cid_len) = Cid::read_prefix(section)?;
            blocks.insert(cid, &section[cid_len..]);
            pos = start + section_len;
        }
        Ok(Self { blocks })
    }

    /// Returns the raw bytes of the block with this CID.
    #[must_use]
    pub fn get(&self, cid: &Cid) -> Option<&'a [u8]> {
        self.blocks.get(cid).copied()
    }

    /// Decodes the block with this CID as a CBOR record, converted to JSON.
    ///
    /// Returns `None` when the block is missing or does not decode.
    #[must_use]
    pub fn decode_record(&self, cid: &Cid, limits: &DecodeLimits) -> Option<serde_json::Value> {
        let bytes = self.get(cid)?;
        let (value, _) = decode_prefix(bytes, limits).ok()?;
        Some(value.to_json())
    }

    /// Number of blocks in the archive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if the archive had no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Reads the varint length at `offset` and checks it fits in the archive.
/// Returns the length and the offset of the first byte after the varint.
fn read_section_len(car: &[u8], offset: usize) -> Result<(usize, usize), CarError> {
    let (len, used) = read_varint(&car[offset..])?;
    let start = offset + used;
    let end = usize::try_from(len)
        .ok()
        .and_then(|n| start.checked_add(n))
        .filter(|&end| end <= car.len())
        .ok_or(CarError::Overrun { offset, len })?;
    Ok((end - start, start))
}
