//! Custom error types for Remora
//!
//! One enum per subsystem; application-level code wraps these in
//! `anyhow::Error` with context.

use thiserror::Error;

/// Proxy-side errors: anything that tears down a single intercepted
/// connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed HTTP message on either side of the relay
    #[error("malformed HTTP message: {0}")]
    Protocol(String),

    /// TLS handshake failure on either side
    #[error("TLS failure: {0}")]
    Tls(String),

    /// Certificate minting produced no output
    #[error("certificate mint produced no output for {host}")]
    CertMintEmpty { host: String },

    /// Certificate minting failed outright
    #[error("certificate mint failed for {host}: {reason}")]
    CertMintFailed { host: String, reason: String },

    /// Connection to the origin server failed
    #[error("upstream connect to {target} failed: {reason}")]
    UpstreamConnect { target: String, reason: String },

    /// A fixed deadline elapsed
    #[error("timed out while {0}")]
    Timeout(&'static str),

    /// Socket read/write/close
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Lookup by id yielded zero results
    #[error("no record with id {0}")]
    NotFound(String),

    /// Supplied id is not in the store's identifier format
    #[error("malformed record id: {0}")]
    BadId(String),

    /// Snapshot persistence failed
    #[error("store persistence failed: {0}")]
    Persist(String),
}

/// Replay engine errors
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("invalid method or header in stored request: {0}")]
    InvalidRequest(String),

    #[error("replay dispatch failed: {0}")]
    Dispatch(#[from] reqwest::Error),
}
