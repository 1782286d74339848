use thiserror::Error;

use crate::ObjectClass;

/// Rejected detector output. Names the offending detection by its position in the input.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("invalid detection #{index} ({class}): {reason}")]
pub struct ValidationError {
    pub index: usize,
    pub class: ObjectClass,
    pub reason: String,
}

impl ValidationError {
    pub(crate) fn new(index: usize, class: &ObjectClass, reason: impl Into<String>) -> Self {
        Self {
            index,
            class: class.clone(),
            reason: reason.into(),
        }
    }
}

/// Synchronous rejection returned by the dispatcher intake.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("dispatcher saturated: {live} live jobs, capacity {capacity}")]
    Saturated { live: usize, capacity: usize },

    #[error("invalid recipient address '{0}'")]
    InvalidRecipient(String),

    #[error("duplicate idempotency key '{key}' (job {existing})")]
    Duplicate { key: String, existing: u64 },

    #[error("dispatcher is shut down")]
    ShutDown,
}

/// Any failed delivery attempt. The dispatcher retries every variant the same way.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("recipient rejected: {0}")]
    Rejected(String),

    #[error("attempt timed out after {0} ms")]
    TimedOut(u64),
}
