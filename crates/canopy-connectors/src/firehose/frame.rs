//! Firehose frame decoding.
//!
//! Each WebSocket binary message is two CBOR items concatenated with no
//! outer length:
//!
//! ```text
//! ┌──────────────────────┬─────────────────────────────────────────────┐
//! │ header {op, t}       │ body {repo, ops[], blocks, seq, time, ...}  │
//! └──────────────────────┴─────────────────────────────────────────────┘
//! ```
//!
//! The header is decoded completely to learn where the body starts, then
//! the body is decoded and must consume every remaining byte.
//!
//! Decoding never fails the connection. [`FrameDecoder::decode`] logs and
//! returns `None` for a bad frame so the reader can drop it and move on.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::cbor::{decode_prefix, CborError, DecodeLimits, Value};
use super::commit::{Commit, OpAction, RepoOp};

/// Header `op` for a regular message.
const OP_MESSAGE: i64 = 1;

/// Header `op` for an error frame.
const OP_ERROR: i64 = -1;

/// Message kind for repository commits.
pub const KIND_COMMIT: &str = "#commit";

/// Message kind for informational notices (e.g. `OutdatedCursor`).
pub const KIND_INFO: &str = "#info";

/// Errors produced while decoding one frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The message had no bytes.
    #[error("empty frame")]
    Empty,

    /// The header item could not be decoded.
    #[error("header: {0}")]
    Header(CborError),

    /// The body item could not be decoded.
    #[error("body: {0}")]
    Body(CborError),

    /// Bytes remained after the body.
    #[error("{0} trailing bytes after body")]
    TrailingBytes(usize),

    /// The header `op` is neither 1 nor -1.
    #[error("unknown header op {0}")]
    UnknownOp(i64),

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong shape.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
}

/// A frame split into its two decoded items.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// The header item.
    pub header: Value,
    /// The body item.
    pub body: Value,
    /// Encoded length of the header, i.e. where the body starts.
    pub header_len: usize,
}

/// A typed firehose message.
#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseMessage {
    /// A repository commit (`#commit`).
    Commit(Commit),
    /// An informational notice (`#info`).
    Info {
        /// Notice name, e.g. `OutdatedCursor`.
        name: String,
        /// Optional human-readable detail.
        message: Option<String>,
    },
    /// An error frame (`op = -1`). The relay closes the stream after it.
    Error {
        /// Error name.
        error: String,
        /// Optional human-readable detail.
        message: Option<String>,
    },
    /// Any other message kind (`#identity`, `#account`, `#sync`, ...).
    Other {
        /// The header `t` value.
        kind: String,
        /// The body `seq`, when present.
        seq: Option<u64>,
    },
}

impl FirehoseMessage {
    /// Returns the stream sequence number the message carries, if any.
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        match self {
            FirehoseMessage::Commit(commit) => Some(commit.seq),
            FirehoseMessage::Other { seq, .. } => *seq,
            FirehoseMessage::Info { .. } | FirehoseMessage::Error { .. } => None,
        }
    }
}

/// Splits one binary message into its header and body items.
///
/// # Errors
///
/// Returns a [`FrameError`] if either item is malformed or bytes remain.
pub fn decode_frame(bytes: &[u8], limits: &DecodeLimits) -> Result<RawFrame, FrameError> {
    if bytes.is_empty() {
        return Err(FrameError::Empty);
    }
    let (header, header_len) = decode_prefix(bytes, limits).map_err(FrameError::Header)?;
    let rest = &bytes[header_len..];
    let (body, body_len) = decode_prefix(rest, limits).map_err(FrameError::Body)?;
    if body_len != rest.len() {
        return Err(FrameError::TrailingBytes(rest.len() - body_len));
    }
    Ok(RawFrame {
        header,
        body,
        header_len,
    })
}

/// Stateless decoder from raw frames to [`FirehoseMessage`]s.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    limits: DecodeLimits,
}

impl FrameDecoder {
    /// Creates a decoder with the given limits.
    #[must_use]
    pub fn new(limits: DecodeLimits) -> Self {
        Self { limits }
    }

    /// Decodes a frame, logging and returning `None` on any failure.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> Option<FirehoseMessage> {
        match self.try_decode(bytes) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "dropping malformed firehose frame");
                None
            }
        }
    }

    /// Decodes a frame into a typed message.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] describing why the frame is unusable.
    pub fn try_decode(&self, bytes: &[u8]) -> Result<FirehoseMessage, FrameError> {
        let frame = decode_frame(bytes, &self.limits)?;
        interpret(&frame)
    }
}

fn interpret(frame: &RawFrame) -> Result<FirehoseMessage, FrameError> {
    let op = frame
        .header
        .get("op")
        .ok_or(FrameError::MissingField("op"))?
        .as_i64()
        .ok_or_else(|| invalid("op", "not an integer"))?;

    match op {
        OP_ERROR => Ok(FirehoseMessage::Error {
            error: required_str(&frame.body, "error")?.to_string(),
            message: optional_str(&frame.body, "message")?,
        }),
        OP_MESSAGE => {
            let kind = required_str(&frame.header, "t")?;
            match kind {
                KIND_COMMIT => parse_commit(&frame.body).map(FirehoseMessage::Commit),
                KIND_INFO => Ok(FirehoseMessage::Info {
                    name: required_str(&frame.body, "name")?.to_string(),
                    message: optional_str(&frame.body, "message")?,
                }),
                other => Ok(FirehoseMessage::Other {
                    kind: other.to_string(),
                    seq: frame.body.get("seq").and_then(Value::as_u64),
                }),
            }
        }
        other => Err(FrameError::UnknownOp(other)),
    }
}

fn parse_commit(body: &Value) -> Result<Commit, FrameError> {
    let repo = required_str(body, "repo")?.to_string();
    let seq = body
        .get("seq")
        .ok_or(FrameError::MissingField("seq"))?
        .as_u64()
        .ok_or_else(|| invalid("seq", "not an unsigned integer"))?;
    let time = parse_time(required_str(body, "time")?)?;

    let ops = body
        .get("ops")
        .ok_or(FrameError::MissingField("ops"))?
        .as_array()
        .ok_or_else(|| invalid("ops", "not an array"))?
        .iter()
        .map(parse_op)
        .collect::<Result<Vec<_>, _>>()?;

    let blocks = match body.get("blocks") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let bytes = v
                .as_bytes()
                .ok_or_else(|| invalid("blocks", "not a byte string"))?;
            (!bytes.is_empty()).then(|| bytes.to_vec())
        }
    };

    Ok(Commit {
        repo,
        ops,
        seq,
        time,
        blocks,
        rev: optional_str(body, "rev")?,
        too_big: optional_bool(body, "tooBig")?,
        rebase: optional_bool(body, "rebase")?,
    })
}

fn parse_op(op: &Value) -> Result<RepoOp, FrameError> {
    let action = required_str(op, "action")?
        .parse::<OpAction>()
        .map_err(|reason| invalid("ops.action", reason))?;
    let path = required_str(op, "path")?.to_string();
    let cid = match op.get("cid") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => Some(
            v.as_link()
                .ok_or_else(|| invalid("ops.cid", "not a cid link"))?
                .clone(),
        ),
    };
    Ok(RepoOp { action, path, cid })
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, FrameError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| invalid("time", e.to_string()))
}

fn required_str<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, FrameError> {
    value
        .get(field)
        .ok_or(FrameError::MissingField(field))?
        .as_str()
        .ok_or_else(|| invalid(field, "not a text string"))
}

fn optional_str(value: &Value, field: &'static str) -> Result<Option<String>, FrameError> {
    match value.get(field) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| invalid(field, "not a text string")),
    }
}

fn optional_bool(value: &Value, field: &'static str) -> Result<bool, FrameError> {
    match value.get(field) {
        None => Ok(false),
        Some(v) if v.is_null() => Ok(false),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| invalid(field, "not a boolean")),
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> FrameError {
    FrameError::InvalidField {
        field,
        reason: reason.into(),
    }
}
