//! Local (non-wire) error taxonomy.
//!
//! These errors never leave the process as-is; they are local failure kinds
//! raised by identity, registry, and transport bookkeeping. Wire-level errors
//! live in [`crate::protocol::error`].

use thiserror::Error;

/// Local error kinds, not carried on the wire.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("identity not initialized")]
    NotInitialized,

    #[error("on-disk state is corrupt: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Protocol(#[from] crate::protocol::error::ProtocolError),
}

pub type NodeResult<T> = Result<T, NodeError>;
