use crate::operation::Direction;

use herald_broker::BrokerBinding;
use thiserror::Error;

/// The result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`], stable enough for callers and
/// monitoring to branch on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Malformed input, rejected before any I/O.
    InvalidArgument,

    /// The registry could not begin, read or commit; nothing changed.
    RegistryUnavailable,

    /// The broker failed while a registry transaction was open; the
    /// transaction was aborted.
    BrokerBindingFailed,

    /// The broker changed but the registry commit failed.
    PartialFailure,

    /// The broker did not accept a published message.
    PublishFailed,

    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Snake-case name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::RegistryUnavailable => "registry_unavailable",
            Self::BrokerBindingFailed => "broker_binding_failed",
            Self::PartialFailure => "partial_failure",
            Self::PublishFailed => "publish_failed",
            Self::Internal => "internal",
        }
    }
}

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A user id or topic failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The registry could not be reached; no state changed.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The broker call failed and the registry transaction was rolled back.
    #[error("{direction} failed at broker binding {binding}; registry rolled back: {reason}")]
    BrokerBindingFailed {
        /// Whether the operation was adding or removing the subscription.
        direction: Direction,
        /// The binding being created or removed.
        binding: BrokerBinding,
        /// The underlying broker failure.
        reason: String,
    },

    /// The broker changed but the registry commit failed. Retrying is safe,
    /// but the two systems disagreed until it succeeds.
    #[error(
        "{direction} of {topic} for {user_id} reached the broker but the registry commit failed: {reason}"
    )]
    PartialFailure {
        /// The user the operation was for.
        user_id: String,
        /// The topic the operation was for.
        topic: String,
        /// Whether the operation was adding or removing the subscription.
        direction: Direction,
        /// The underlying commit failure.
        reason: String,
    },

    /// The broker did not accept a publish or broadcast.
    #[error("publish with routing key {routing_key} failed: {reason}")]
    PublishFailed {
        /// The routing key of the message.
        routing_key: String,
        /// The underlying broker failure.
        reason: String,
    },

    /// Unexpected failure, e.g. a corrupt stored record.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
            Self::BrokerBindingFailed { .. } => ErrorKind::BrokerBindingFailed,
            Self::PartialFailure { .. } => ErrorKind::PartialFailure,
            Self::PublishFailed { .. } => ErrorKind::PublishFailed,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether repeating the same call may succeed and converges to a
    /// consistent state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidArgument(_) | Self::Internal(_))
    }
}
