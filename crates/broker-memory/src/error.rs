use herald_broker::BrokerError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Queue or binding management failed (injected).
    #[error("broker unreachable: {operation} on queue {queue_name} failed")]
    Management {
        /// The management operation that failed.
        operation: &'static str,
        /// The queue the operation targeted.
        queue_name: String,
    },

    /// Binding refers to a queue that was never declared.
    #[error("queue {0} not declared")]
    QueueNotFound(String),

    /// Publishing failed (injected).
    #[error("broker rejected publish with routing key {0}")]
    Publish(String),
}

impl BrokerError for Error {}
