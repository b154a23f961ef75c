//! Store commands and replies.

use regioncache_core::{RegionCacheResult, TransportError};
use std::fmt;
use std::time::Duration;

/// Condition attached to a `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCondition {
    Always,
    /// `NX`: only write when the key does not exist.
    IfAbsent,
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: String,
    },
    MGet {
        keys: Vec<String>,
    },
    Set {
        key: String,
        value: Vec<u8>,
        expiry: Option<Duration>,
        condition: SetCondition,
    },
    Del {
        keys: Vec<String>,
    },
    Incr {
        key: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    SAdd {
        key: String,
        member: Vec<u8>,
    },
    SRem {
        key: String,
        member: Vec<u8>,
    },
    SMembers {
        key: String,
    },
    LPush {
        key: String,
        value: Vec<u8>,
    },
    LRange {
        key: String,
        start: i64,
        stop: i64,
    },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Command::Get { key: key.into() }
    }

    pub fn mget(keys: Vec<String>) -> Self {
        Command::MGet { keys }
    }

    pub fn set(key: impl Into<String>, value: Vec<u8>) -> Self {
        Command::Set {
            key: key.into(),
            value,
            expiry: None,
            condition: SetCondition::Always,
        }
    }

    /// `SET key value EX ttl`
    pub fn set_ex(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Command::Set {
            key: key.into(),
            value,
            expiry: Some(ttl),
            condition: SetCondition::Always,
        }
    }

    /// `SET key value NX EX ttl`
    pub fn set_nx_ex(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Command::Set {
            key: key.into(),
            value,
            expiry: Some(ttl),
            condition: SetCondition::IfAbsent,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Command::Del {
            keys: vec![key.into()],
        }
    }

    pub fn incr(key: impl Into<String>) -> Self {
        Command::Incr { key: key.into() }
    }

    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        Command::Rename {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn expire(key: impl Into<String>, ttl: Duration) -> Self {
        Command::Expire {
            key: key.into(),
            ttl,
        }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<Vec<u8>>) -> Self {
        Command::SAdd {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<Vec<u8>>) -> Self {
        Command::SRem {
            key: key.into(),
            member: member.into(),
        }
    }

    pub fn smembers(key: impl Into<String>) -> Self {
        Command::SMembers { key: key.into() }
    }

    pub fn lpush(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Command::LPush {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn lrange(key: impl Into<String>, start: i64, stop: i64) -> Self {
        Command::LRange {
            key: key.into(),
            start,
            stop,
        }
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::MGet { .. } => "MGET",
            Command::Set { .. } => "SET",
            Command::Del { .. } => "DEL",
            Command::Incr { .. } => "INCR",
            Command::Rename { .. } => "RENAME",
            Command::Expire { .. } => "EXPIRE",
            Command::SAdd { .. } => "SADD",
            Command::SRem { .. } => "SREM",
            Command::SMembers { .. } => "SMEMBERS",
            Command::LPush { .. } => "LPUSH",
            Command::LRange { .. } => "LRANGE",
        }
    }
}

/// A store reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
    /// Per-command failure inside a pipeline or transaction.
    Error(String),
}

impl Reply {
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Bulk payload, `None` for nil.
    pub fn into_bytes(self, command: &str) -> RegionCacheResult<Option<Vec<u8>>> {
        match self {
            Reply::Nil => Ok(None),
            Reply::Bulk(bytes) => Ok(Some(bytes)),
            Reply::Error(reason) => Err(command_failed(command, reason)),
            other => Err(unexpected(command, &other)),
        }
    }

    pub fn into_int(self, command: &str) -> RegionCacheResult<i64> {
        match self {
            Reply::Int(n) => Ok(n),
            Reply::Error(reason) => Err(command_failed(command, reason)),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Integer stored as a string value; nil reads as zero.
    pub fn into_counter(self, command: &str) -> RegionCacheResult<i64> {
        match self {
            Reply::Nil => Ok(0),
            Reply::Int(n) => Ok(n),
            Reply::Bulk(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or_else(|| unexpected(command, &Reply::Bulk(bytes.clone()))),
            Reply::Error(reason) => Err(command_failed(command, reason)),
            other => Err(unexpected(command, &other)),
        }
    }

    /// Reply of a conditional `SET`: `Ok` when written, nil when skipped.
    pub fn into_written(self, command: &str) -> RegionCacheResult<bool> {
        match self {
            Reply::Ok => Ok(true),
            Reply::Nil => Ok(false),
            Reply::Error(reason) => Err(command_failed(command, reason)),
            other => Err(unexpected(command, &other)),
        }
    }

    pub fn into_array(self, command: &str) -> RegionCacheResult<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Error(reason) => Err(command_failed(command, reason)),
            other => Err(unexpected(command, &other)),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nil => write!(f, "(nil)"),
            Reply::Ok => write!(f, "OK"),
            Reply::Int(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Reply::Array(items) => write!(f, "(array of {})", items.len()),
            Reply::Error(reason) => write!(f, "(error) {}", reason),
        }
    }
}

fn command_failed(command: &str, reason: String) -> regioncache_core::RegionCacheError {
    TransportError::CommandFailed {
        command: command.to_string(),
        reason,
    }
    .into()
}

fn unexpected(command: &str, reply: &Reply) -> regioncache_core::RegionCacheError {
    TransportError::UnexpectedReply {
        command: command.to_string(),
        reply: reply.to_string(),
    }
    .into()
}
