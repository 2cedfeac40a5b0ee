//! Content identifiers (CIDs) as they appear on the firehose.
//!
//! CIDs show up in two encodings:
//! - inside CBOR as tag 42 over a byte string whose first byte is the
//!   identity multibase prefix `0x00`;
//! - raw at the head of every CAR section, where their length has to be
//!   recovered from the varints they are built from.
//!
//! Only enough structure is parsed to compare CIDs and find their length.

use std::fmt;

/// Multihash code for SHA2-256, the only hash CIDv0 allows.
const SHA2_256: u64 = 0x12;

/// Digest length of SHA2-256.
const SHA2_256_LEN: u64 = 32;

/// Multibase prefix for lowercase unpadded base32.
const MULTIBASE_BASE32: char = 'b';

/// Errors produced while parsing a binary CID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidError {
    /// The input ended inside the CID.
    #[error("truncated cid")]
    Truncated,

    /// A varint ran past 64 bits.
    #[error("varint overflow")]
    VarintOverflow,

    /// The CID version is neither 0 nor 1.
    #[error("unsupported cid version {0}")]
    UnsupportedVersion(u64),

    /// A tag-42 link did not start with the identity multibase prefix.
    #[error("cid link missing multibase prefix")]
    MissingPrefix,
}

/// A binary content identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(Vec<u8>);

impl Cid {
    /// Parses the CID at the start of `bytes` and returns it with the
    /// number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns a [`CidError`] if the input is truncated or the version is
    /// unknown.
    pub fn read_prefix(bytes: &[u8]) -> Result<(Self, usize), CidError> {
        let len = cid_len(bytes)?;
        Ok((Self(bytes[..len].to_vec()), len))
    }

    /// Builds a CID from the payload of a CBOR tag-42 byte string.
    ///
    /// # Errors
    ///
    /// Returns [`CidError::MissingPrefix`] if the leading `0x00` is absent,
    /// or another [`CidError`] if the remainder is not exactly one CID.
    pub fn from_link_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        let Some((&0x00, rest)) = bytes.split_first() else {
            return Err(CidError::MissingPrefix);
        };
        let (cid, used) = Self::read_prefix(rest)?;
        if used != rest.len() {
            return Err(CidError::Truncated);
        }
        Ok(cid)
    }

    /// Returns the raw binary form.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns `true` for a CIDv0 (a bare sha2-256 multihash).
    #[must_use]
    pub fn is_v0(&self) -> bool {
        is_v0_prefix(&self.0)
    }

    /// Returns the canonical string form: CIDv1 as base32-lower multibase
    /// (`bafy...`), CIDv0 as plain base58btc (`Qm...`).
    #[must_use]
    pub fn to_multibase(&self) -> String {
        if self.is_v0() {
            return bs58::encode(&self.0).into_string();
        }
        let encoded = data_encoding::BASE32_NOPAD.encode(&self.0);
        let mut out = String::with_capacity(1 + encoded.len());
        out.push(MULTIBASE_BASE32);
        out.push_str(&encoded.to_ascii_lowercase());
        out
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_multibase())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_multibase())
    }
}

/// Reads an unsigned LEB128 varint, returning the value and bytes consumed.
///
/// # Errors
///
/// Returns [`CidError::Truncated`] if the input ends mid-varint, or
/// [`CidError::VarintOverflow`] past ten bytes.
pub fn read_varint(bytes: &[u8]) -> Result<(u64, usize), CidError> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= 10 {
            return Err(CidError::VarintOverflow);
        }
        let low = u64::from(byte & 0x7f);
        if i == 9 && low > 1 {
            return Err(CidError::VarintOverflow);
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CidError::Truncated)
}

fn is_v0_prefix(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && u64::from(bytes[0]) == SHA2_256 && u64::from(bytes[1]) == SHA2_256_LEN
}

fn cid_len(bytes: &[u8]) -> Result<usize, CidError> {
    // CIDv0 is a bare sha2-256 multihash: 0x12 0x20 <32 bytes>.
    if is_v0_prefix(bytes) {
        let len = 34;
        return if bytes.len() >= len {
            Ok(len)
        } else {
            Err(CidError::Truncated)
        };
    }

    let mut pos = 0;
    let (version, n) = read_varint(bytes)?;
    pos += n;
    if version != 1 {
        return Err(CidError::UnsupportedVersion(version));
    }
    let (_codec, n) = read_varint(&bytes[pos..])?;
    pos += n;
    let (_hash_code, n) = read_varint(&bytes[pos..])?;
    pos += n;
    let (digest_len, n) = read_varint(&bytes[pos..])?;
    pos += n;

    let digest_len = usize::try_from(digest_len).map_err(|_| CidError::Truncated)?;
    let end = pos.checked_add(digest_len).ok_or(CidError::Truncated)?;
    if end > bytes.len() {
        return Err(CidError::Truncated);
    }
    Ok(end)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A CIDv1 (dag-cbor, sha2-256) with a recognisable digest.
    pub(crate) fn sample_cid_bytes(fill: u8) -> Vec<u8> {
        let mut out = vec![0x01, 0x71, 0x12, 0x20];
        out.extend(std::iter::repeat(fill).take(32));
        out
    }

    #[test]
    fn test_read_varint() {
        assert_eq!(read_varint(&[0x01]).unwrap(), (1, 1));
        assert_eq!(read_varint(&[0xac, 0x02]).unwrap(), (300, 2));
        assert_eq!(read_varint(&[0x80]), Err(CidError::Truncated));
        assert_eq!(read_varint(&[0xff; 11]), Err(CidError::VarintOverflow));
    }

    #[test]
    fn test_read_prefix_v1() {
        let mut bytes = sample_cid_bytes(0xab);
        bytes.extend_from_slice(b"trailing block data");
        let (cid, used) = Cid::read_prefix(&bytes).unwrap();
        assert_eq!(used, 36);
        assert_eq!(cid.as_bytes(), &sample_cid_bytes(0xab)[..]);
    }

    #[test]
    fn test_read_prefix_v0() {
        let mut bytes = vec![0x12, 0x20];
        bytes.extend(std::iter::repeat(7).take(32));
        let (_, used) = Cid::read_prefix(&bytes).unwrap();
        assert_eq!(used, 34);
    }

    #[test]
    fn test_v1_renders_base32() {
        let (cid, _) = Cid::read_prefix(&sample_cid_bytes(0xab)).unwrap();
        assert_eq!(
            cid.to_string(),
            "bafyreiflvov2xk5lvov2xk5lvov2xk5lvov2xk5lvov2xk5lvov2xk5lvm"
        );
        assert!(!cid.is_v0());
    }

    #[test]
    fn test_v0_renders_base58() {
        let mut bytes = vec![0x12, 0x20];
        bytes.extend(std::iter::repeat(7).take(32));
        let (cid, _) = Cid::read_prefix(&bytes).unwrap();
        assert!(cid.is_v0());
        assert_eq!(
            cid.to_multibase(),
            "QmNp5n7FFav5ZDaHAj6HzuhJ8LDbL1N6NRzAgT6piWS2Kx"
        );
    }

    #[test]
    fn test_truncated_digest() {
        let bytes = &sample_cid_bytes(1)[..20];
        assert_eq!(Cid::read_prefix(bytes), Err(CidError::Truncated));
    }

    #[test]
    fn test_unsupported_version() {
        assert_eq!(
            Cid::read_prefix(&[0x02, 0x71, 0x12, 0x00]),
            Err(CidError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_from_link_bytes() {
        let mut link = vec![0x00];
        link.extend(sample_cid_bytes(3));
        let cid = Cid::from_link_bytes(&link).unwrap();
        assert_eq!(cid.as_bytes(), &sample_cid_bytes(3)[..]);
        assert!(cid.to_multibase().starts_with("bafyrei"));

        assert_eq!(
            Cid::from_link_bytes(&sample_cid_bytes(3)),
            Err(CidError::MissingPrefix)
        );
    }
}
