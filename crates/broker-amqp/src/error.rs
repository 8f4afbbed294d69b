use herald_broker::BrokerError;
use thiserror::Error;

/// Errors that can occur when talking to an AMQP broker.
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to connect or open a channel.
    #[error("failed to connect to AMQP broker: {0}")]
    Connect(lapin::Error),

    /// Failed to declare the exchange.
    #[error("failed to declare exchange {exchange}: {source}")]
    DeclareExchange {
        /// The exchange name.
        exchange: String,
        /// The underlying AMQP error.
        source: lapin::Error,
    },

    /// Failed to declare a queue.
    #[error("failed to declare queue {queue_name}: {source}")]
    DeclareQueue {
        /// The queue name.
        queue_name: String,
        /// The underlying AMQP error.
        source: lapin::Error,
    },

    /// Failed to bind a queue.
    #[error("failed to bind {queue_name} to {routing_key}: {source}")]
    Bind {
        /// The queue name.
        queue_name: String,
        /// The routing key.
        routing_key: String,
        /// The underlying AMQP error.
        source: lapin::Error,
    },

    /// Failed to unbind a queue.
    #[error("failed to unbind {queue_name} from {routing_key}: {source}")]
    Unbind {
        /// The queue name.
        queue_name: String,
        /// The routing key.
        routing_key: String,
        /// The underlying AMQP error.
        source: lapin::Error,
    },

    /// Failed to publish a message.
    #[error("failed to publish with routing key {routing_key}: {source}")]
    Publish {
        /// The routing key.
        routing_key: String,
        /// The underlying AMQP error.
        source: lapin::Error,
    },

    /// The broker negatively acknowledged a published message.
    #[error("broker nacked message with routing key {0}")]
    Nacked(String),

    /// The broker was closed.
    #[error("AMQP broker closed")]
    Closed,

    /// Failed to close the connection.
    #[error("failed to close AMQP connection: {0}")]
    Close(lapin::Error),
}

impl BrokerError for Error {}
