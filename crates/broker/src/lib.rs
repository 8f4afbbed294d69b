//! Abstract interface for topic-exchange message brokers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod routing;

pub use routing::routing_key_matches;

use std::error::Error;
use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use async_trait::async_trait;
use bytes::Bytes;

/// Marker trait for broker errors.
pub trait BrokerError: Debug + Error + Send + Sync + 'static {}

/// A routing rule connecting a routing key to a queue on an exchange.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BrokerBinding {
    /// The topic exchange the binding lives on.
    pub exchange: String,

    /// The queue receiving matching messages.
    pub queue_name: String,

    /// The routing key (or pattern) the queue is bound with.
    pub routing_key: String,
}

impl Display for BrokerBinding {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{} <- {}", self.exchange, self.queue_name, self.routing_key)
    }
}

/// A topic-exchange message broker.
///
/// Every method must be idempotent: declaring an existing queue, binding an
/// existing key or unbinding a missing one succeeds without further effect.
#[async_trait]
pub trait Broker: Clone + Send + Sync + 'static {
    /// The error type for broker operations.
    type Error: BrokerError;

    /// The name of the shared topic exchange.
    fn exchange(&self) -> &str;

    /// Declares a durable, non-exclusive queue if it does not already exist.
    async fn declare_queue(&self, queue_name: &str) -> Result<(), Self::Error>;

    /// Whether a queue has been declared. Never creates it.
    async fn queue_exists(&self, queue_name: &str) -> Result<bool, Self::Error>;

    /// Binds a queue to the exchange under a routing key.
    async fn bind(&self, queue_name: &str, routing_key: &str) -> Result<(), Self::Error>;

    /// Removes the binding of a queue to the exchange under a routing key.
    async fn unbind(&self, queue_name: &str, routing_key: &str) -> Result<(), Self::Error>;

    /// Publishes a persistent message to the exchange under a routing key.
    ///
    /// Resolves once the broker has accepted the message.
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), Self::Error>;
}
