//! Error types
//!
//! Typed failures for configuration loading and server startup. Faults that
//! occur inside an established session are never surfaced through these
//! types; the dispatcher and transfer code translate them into numeric FTP
//! responses on the control channel instead.

use std::io;

use thiserror::Error;

/// Configuration file loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("line {line}: expected `<key>:`")]
    MissingColon { line: usize },
    #[error("line {line}: expected `$<value>`")]
    MissingValue { line: usize },
    #[error("line {line}: invalid value for key `{key}`")]
    InvalidValue { line: usize, key: String },
    #[error("line {line}: unknown key `{key}`")]
    UnknownKey { line: usize, key: String },
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
}

/// Server startup and event-loop errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control listener: {0}")]
    Bind(#[source] io::Error),
    #[error("event loop failed: {0}")]
    Reactor(#[source] io::Error),
}
