//! Error classes of the polling runtime.
//!
//! - [`ConfigError`]: a mandatory setting is missing or mistyped. Fatal to the
//!   owning instance at start-up; the instance is never constructed.
//! - [`TransportError`]: connect/send/receive failed. Always recoverable, the
//!   driver state machine reconnects with backoff.
//! - [`crate::protocol::ProtocolError`]: checksum or token trouble. Recoverable
//!   up to the configured threshold, then the driver forces a resync.
//! - [`InvariantViolation`]: a defect (type mismatch, missing mandatory
//!   capability, foreign command). Halts the affected instance, never the
//!   process.
//!
//! Transport and protocol errors never leave the driver; consumers only see
//! `data-valid` flipping to `false`.

use crate::capability::ValueKind;
use crate::scheduler::ComponentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing mandatory setting '{0}'")]
    Missing(String),

    #[error("invalid setting '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error("transport '{0}' is not available in this build")]
    UnsupportedTransport(String),

    #[error("duplicate instance name '{0}'")]
    DuplicateName(String),

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed by peer")]
    Closed,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("cannot resolve '{0}'")]
    Resolve(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Programming-invariant violations. Seeing one of these means a bug.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("capability '{capability}' holds {expected:?}, refusing write of {actual:?}")]
    TypeMismatch {
        capability: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("capability '{0}' does not exist")]
    MissingCapability(String),

    #[error("capability '{0}' already exists")]
    DuplicateCapability(String),

    #[error("mandatory capability '{0}' cannot be removed")]
    MandatoryRemoval(String),

    #[error("no capability store registered for {0}")]
    UnknownOwner(ComponentId),

    #[error("command kind does not belong to target '{0}'")]
    ForeignCommand(String),

    #[error("scheduler queue overflow")]
    SchedulerOverflow,
}

/// Lookup failures on the consumer side. Capabilities appear lazily, so a
/// missing name is an ordinary outcome here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("unknown owner {0}")]
    UnknownOwner(ComponentId),

    #[error("owner {owner} has no capability '{name}'")]
    UnknownCapability { owner: ComponentId, name: String },

    #[error("unknown observer {0}")]
    UnknownObserver(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler queue full")]
    QueueFull,
}

impl From<SchedulerError> for InvariantViolation {
    fn from(_: SchedulerError) -> Self {
        InvariantViolation::SchedulerOverflow
    }
}

impl From<CapabilityError> for InvariantViolation {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::UnknownOwner(owner) => InvariantViolation::UnknownOwner(owner),
            CapabilityError::UnknownCapability { name, .. } => {
                InvariantViolation::MissingCapability(name)
            }
            CapabilityError::UnknownObserver(id) => {
                InvariantViolation::MissingCapability(format!("observer #{id}"))
            }
        }
    }
}
