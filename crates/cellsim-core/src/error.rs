//! Error taxonomy shared by every layer of the kernel.

use cellsim_index::IndexError;
use thiserror::Error;

use crate::identity::Uid;

/// Errors surfaced by storage, the execution context and the scheduler.
#[derive(Debug, Error)]
pub enum SimError {
    /// The UID was removed or never existed.
    #[error("no simulation object with uid {uid}")]
    NotFound { uid: Uid },

    /// A concrete type other than the stored one was requested.
    #[error("type mismatch: requested {expected}, stored {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// The concrete type was never registered with the resource manager.
    #[error("object type {type_name} is not registered")]
    UnregisteredType { type_name: &'static str },

    /// A method was called outside the phase it is valid in.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Unrecoverable condition raised by an operation.
    #[error("fatal simulation error: {0}")]
    Fatal(String),

    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A configuration override named a key that does not exist.
    #[error("unknown configuration key `{0}`")]
    UnknownConfigKey(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl SimError {
    /// Lookup failures that callers are expected to handle themselves.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::TypeMismatch { .. })
    }

    /// Errors that end a scheduler run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Index(_))
    }
}

/// Convenience alias used throughout the crate.
pub type SimResult<T> = Result<T, SimError>;
