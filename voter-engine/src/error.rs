//! Error types for configuration and server lifecycle.

use std::net::SocketAddrV4;

use thiserror::Error;

/// Configuration file problems. These fail a load or reload; the previous
/// configuration stays in effect on reload failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("client {0} has an invalid authentication digest (cannot be 0)")]
    ZeroDigest(String),

    #[error("clients {0} and {1} have the same authentication digest")]
    DuplicateDigest(String, String),

    #[error("node {0}: primary not specified properly")]
    BadPrimary(u32),
}

/// Server lifecycle and control-surface errors. Runtime packet errors are
/// logged and dropped, never surfaced here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        source: std::io::Error,
    },

    #[error("socket setup failed: {0}")]
    Socket(std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no such node {0}")]
    NoSuchNode(u32),

    #[error("no such client {0}")]
    NoSuchClient(String),

    #[error("recording open failed: {0}")]
    Record(std::io::Error),
}
