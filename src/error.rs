// src/error.rs
use std::io;

use thiserror::Error;

/// Failures that end a pairing attempt before a code can be shown.
#[derive(Debug, Error)]
pub enum PairError {
    #[error("no LAN IPv4 address available")]
    AddressUnavailable,

    #[error("pairing port is already in use: {0}")]
    PortBindConflict(#[source] io::Error),

    #[error("pairing server failed to start: {0}")]
    ServerStartFailure(String),

    #[error("failed to encode pairing code: {0}")]
    Encode(String),
}

impl PairError {
    pub(crate) fn from_bind(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => PairError::PortBindConflict(e),
            _ => PairError::ServerStartFailure(e.to_string()),
        }
    }

    /// Port conflicts are the only condition worth retrying automatically.
    pub fn is_transient(&self) -> bool {
        matches!(self, PairError::PortBindConflict(_))
    }
}
