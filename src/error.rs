use std::fmt;

use thiserror::Error;

/// A terminal identifier that does not match the accepted grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid terminal id '{id}': {reason}")]
pub struct TargetError {
    pub id: String,
    pub reason: &'static str,
}

impl TargetError {
    pub fn new(id: &str, reason: &'static str) -> Self {
        Self {
            id: id.to_string(),
            reason,
        }
    }
}

/// Failure to bring up the backing process for a session.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// Pseudo-terminal allocation or configuration failed.
    #[error("failed to allocate pty: {0}")]
    Pty(#[from] std::io::Error),

    /// The external program could not be started.
    #[error("failed to start {program}: {source}")]
    Process {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Send or receive failure on an attached transport.
#[derive(Debug, Error)]
#[error("transport error: {0}")]
pub struct TransportError(String);

impl TransportError {
    pub fn new(msg: impl fmt::Display) -> Self {
        Self(msg.to_string())
    }
}
