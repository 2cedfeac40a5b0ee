//! Repository commit types carried by `#commit` frames.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cid::Cid;

/// One atomic batch of mutations applied to a single repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Repository identifier (a DID).
    pub repo: String,
    /// Mutations, in the order the repository applied them.
    pub ops: Vec<RepoOp>,
    /// Stream sequence number; strictly increasing within a connection.
    pub seq: u64,
    /// Wall-clock time the relay emitted the commit.
    pub time: DateTime<Utc>,
    /// CAR archive holding the blocks touched by this commit, if sent.
    pub blocks: Option<Vec<u8>>,
    /// Repository revision after this commit.
    pub rev: Option<String>,
    /// The relay dropped `blocks` because the commit was too large.
    pub too_big: bool,
    /// The commit rewrote repository history.
    pub rebase: bool,
}

/// One mutation within a [`Commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct RepoOp {
    /// What happened to the record.
    pub action: OpAction,
    /// `collection/record-key`.
    pub path: String,
    /// CID of the new record version; absent for deletes.
    pub cid: Option<Cid>,
}

/// Mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    /// A new record.
    Create,
    /// A new version of an existing record.
    Update,
    /// The record was removed.
    Delete,
}

impl OpAction {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

impl fmt::Display for OpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OpAction::Create),
            "update" => Ok(OpAction::Update),
            "delete" => Ok(OpAction::Delete),
            other => Err(format!("unknown op action '{other}'")),
        }
    }
}
