use std::time::Duration;

use thiserror::Error;

use crate::entity::EntityKey;
use crate::leases::{HolderToken, LeaseKey};
use crate::safety::ViolationKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Timeout after {waited:?} waiting for the {key} lock for {requester} (held by {holder})")]
    LockAcquireFailure {
        key: LeaseKey,
        requester: HolderToken,
        holder: String,
        waited: Duration,
    },

    #[error("Consistency violation ({kind}): {message}")]
    ConsistencyViolation { kind: ViolationKind, message: String },

    #[error("Entity {0} not found")]
    EntityNotFound(EntityKey),

    #[error("Cannot acquire the user lock for a {kind} entity: no lock-id function")]
    MissingLockId { kind: String },

    #[error("Entity store error: {0}")]
    EntityStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for audit findings, which callers may choose to tolerate
    pub fn is_violation(&self) -> bool {
        matches!(self, Error::ConsistencyViolation { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
