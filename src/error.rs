//! Error types for mailmirror.

use std::path::PathBuf;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Mail source error: {0}")]
    Source(#[from] SourceError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Dedup ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Failed to create ledger directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read ledger {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to append to ledger {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Mail retrieval errors (POP3 / IMAP).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{protocol} connect to {addr} failed: {reason}")]
    Connect {
        protocol: &'static str,
        addr: String,
        reason: String,
    },

    #[error("{protocol} TLS setup failed: {reason}")]
    Tls {
        protocol: &'static str,
        reason: String,
    },

    #[error("{protocol} authentication failed for {username}: {reason}")]
    Auth {
        protocol: &'static str,
        username: String,
        reason: String,
    },

    #[error("{protocol} {command} failed: {reason}")]
    Protocol {
        protocol: &'static str,
        command: String,
        reason: String,
    },

    #[error("{protocol} I/O error: {source}")]
    Io {
        protocol: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Fetch task failed: {0}")]
    Task(String),
}

/// Outbound SMTP relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build envelope: {0}")]
    Envelope(String),

    #[error("SMTP TLS setup failed: {0}")]
    Tls(String),

    #[error("SMTP send to {to} via {host} failed: {reason}")]
    Smtp {
        host: String,
        to: String,
        reason: String,
    },

    #[error("Relay task failed: {0}")]
    Task(String),
}

/// Result type alias for mailmirror.
pub type Result<T> = std::result::Result<T, Error>;
