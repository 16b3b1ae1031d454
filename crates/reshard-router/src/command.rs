//! Store commands
//!
//! The facade's operations as one closed set, so routing is decided by the
//! command's shape (read or write) in a single place.

use std::time::Duration;

use crate::connection::{CommandFlags, HashEntry, KvConnection};
use crate::error::StoreError;

/// Whether a command reads from one cluster or writes to every target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandShape {
    Read,
    Write,
}

/// A single key-value command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Expire {
        key: String,
        ttl: Duration,
        flags: CommandFlags,
    },
    Delete {
        key: String,
        flags: CommandFlags,
    },
    HashGet {
        key: String,
        fields: Vec<String>,
        flags: CommandFlags,
    },
    HashSet {
        key: String,
        entries: Vec<HashEntry>,
        flags: CommandFlags,
    },
}

/// What a command returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A single value (`Get`)
    Value(Option<String>),
    /// One slot per requested field (`HashGet`)
    Values(Vec<Option<String>>),
    /// Success indicator of a write
    Done(bool),
}

impl Reply {
    /// `false` only for a write the store reported as not applied
    pub fn is_success(&self) -> bool {
        match self {
            Reply::Done(ok) => *ok,
            Reply::Value(_) | Reply::Values(_) => true,
        }
    }
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration, flags: CommandFlags) -> Self {
        Command::Expire {
            key: key.into(),
            ttl,
            flags,
        }
    }

    pub fn delete(key: impl Into<String>, flags: CommandFlags) -> Self {
        Command::Delete {
            key: key.into(),
            flags,
        }
    }

    pub fn hash_get(key: impl Into<String>, fields: Vec<String>, flags: CommandFlags) -> Self {
        Command::HashGet {
            key: key.into(),
            fields,
            flags,
        }
    }

    pub fn hash_set(key: impl Into<String>, entries: Vec<HashEntry>, flags: CommandFlags) -> Self {
        Command::HashSet {
            key: key.into(),
            entries,
            flags,
        }
    }

    pub fn shape(&self) -> CommandShape {
        match self {
            Command::Get { .. } | Command::HashGet { .. } => CommandShape::Read,
            Command::Set { .. }
            | Command::Expire { .. }
            | Command::Delete { .. }
            | Command::HashSet { .. } => CommandShape::Write,
        }
    }

    /// Command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Expire { .. } => "EXPIRE",
            Command::Delete { .. } => "DEL",
            Command::HashGet { .. } => "HMGET",
            Command::HashSet { .. } => "HSET",
        }
    }

    /// The store key the command operates on
    pub fn key(&self) -> &str {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Expire { key, .. }
            | Command::Delete { key, .. }
            | Command::HashGet { key, .. }
            | Command::HashSet { key, .. } => key,
        }
    }

    /// Run the command over one connection
    pub async fn apply(&self, connection: &dyn KvConnection) -> Result<Reply, StoreError> {
        match self {
            Command::Get { key } => connection.get(key).await.map(Reply::Value),
            Command::Set { key, value, ttl } => {
                connection.set(key, value, *ttl).await.map(Reply::Done)
            }
            Command::Expire { key, ttl, flags } => {
                connection.expire(key, *ttl, *flags).await.map(Reply::Done)
            }
            Command::Delete { key, flags } => connection.delete(key, *flags).await.map(Reply::Done),
            Command::HashGet { key, fields, flags } => {
                connection.hash_get(key, fields, *flags).await.map(Reply::Values)
            }
            Command::HashSet { key, entries, flags } => {
                connection.hash_set(key, entries, *flags).await.map(Reply::Done)
            }
        }
    }
}
