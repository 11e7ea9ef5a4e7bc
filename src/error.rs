//! Error types for charfinder-server.
//!
//! Only `BindError` and `ConfigError` are fatal. Everything else is scoped to
//! the index loader or to a single connection and never escapes it.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The listening socket could not be created.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: io::Error,
}

/// Index construction failed. The index stays unavailable for the lifetime
/// of the server.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read index data '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed index data '{}' at line {line}: {reason}", .path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("index source contained no character names")]
    Empty,

    #[error("index loader panicked")]
    Panicked,
}

/// I/O failure on a single client connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

/// Top-level failure reported by the binary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("runtime error: {0}")]
    Io(#[from] io::Error),
}
