//! Per-layer error sum types. Each layer propagates its own kind rather than
//! throwing across boundaries; the session engines translate the lower
//! layers' errors into the retry policy described in the design notes.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("protocol framing error: {0}")]
    Protocol(String),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u32),
    #[error("read timed out")]
    Timeout,
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot open catalog: {0}")]
    Open(#[source] rusqlite::Error),
    #[error("cannot create schema: {0}")]
    Schema(#[source] rusqlite::Error),
    #[error("cannot prepare statement: {0}")]
    Prepare(#[source] rusqlite::Error),
    #[error("cannot read row: {0}")]
    Read(#[source] rusqlite::Error),
    #[error("cannot write row: {0}")]
    Write(#[source] rusqlite::Error),
    #[error("cannot create catalog directory: {0}")]
    Io(#[from] io::Error),
}

impl From<rusqlite::Error> for CatalogError {
    fn from(e: rusqlite::Error) -> Self {
        CatalogError::Write(e)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected response for the in-flight request")]
    Unexpected,
    #[error("unsupported message type")]
    Unsupported,
    #[error("server reported a protocol version mismatch, switch to {0}")]
    VersionMismatch(u32),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The taxonomy from the design notes: auth/config failures are fatal,
/// connection failures are transient (retryable with backoff), mutation
/// errors are recoverable (retryable via rewind), everything else is
/// either skippable or an internal-server condition.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed")]
    FatalAuth,
    #[error("configuration error: {0}")]
    FatalConfig(String),
    #[error("connection lost: {0}")]
    TransientConnection(#[source] TransportError),
    #[error("server reported a recoverable mutation error after {0} retries")]
    RecoverableExhausted(u32),
    #[error("server reported an internal error")]
    Internal,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option {0:?}")]
    MissingRequired(&'static str),
    #[error("cannot read config file {path:?}: {source}")]
    Read { path: String, #[source] source: io::Error },
    #[error("cannot parse config file {path:?}: {source}")]
    Parse { path: String, #[source] source: toml::de::Error },
    #[error("cannot write default config file {path:?}: {source}")]
    Write { path: String, #[source] source: io::Error },
}
