//! Keeps a subscription registry and a topic broker's bindings in agreement.
//!
//! A subscribe or unsubscribe runs as one protocol across both systems:
//!
//! 1. begin a registry transaction and stage the mutation;
//! 2. with the transaction still open, declare the user's queue and bind the
//!    topic's routing key, or unbind it from an existing queue;
//! 3. commit if the broker succeeded, abort if it did not.
//!
//! A broker failure is compensated by the abort and reported as
//! [`Error::BrokerBindingFailed`]. A commit failure after the broker already
//! changed cannot be compensated and is reported as [`Error::PartialFailure`].
//! Both sides are idempotent, so retrying either error converges.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod operation;

pub use error::{Error, ErrorKind, Result};
pub use operation::{
    BROADCAST_ROUTING_KEY, Direction, SubscriptionOperation, SubscriptionOutcome, queue_name,
    validate_topic, validate_user_id,
};

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use herald_broker::{Broker, BrokerBinding};
use herald_registry::{Registry, RegistryError, RegistryTransaction, TopicChange};
use tracing::{debug, error, info, instrument, warn};

/// Default bound on each individual registry or broker call.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Operations offered to callers (the HTTP layer).
#[async_trait]
pub trait SubscriptionManagement: Clone + Send + Sync + 'static {
    /// Subscribes a user to a topic.
    async fn subscribe(&self, user_id: &str, topic: &str) -> Result<SubscriptionOutcome>;

    /// Unsubscribes a user from a topic.
    async fn unsubscribe(&self, user_id: &str, topic: &str) -> Result<SubscriptionOutcome>;

    /// The topics a user is currently subscribed to.
    async fn subscriptions(&self, user_id: &str) -> Result<BTreeSet<String>>;

    /// Publishes a message to every queue bound to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Publishes a message to every user's queue.
    async fn broadcast(&self, payload: Bytes) -> Result<()>;
}

/// Options for creating a new [`SubscriptionCoordinator`].
pub struct SubscriptionCoordinatorOptions<R, B>
where
    R: Registry,
    B: Broker,
{
    /// The topic broker.
    pub broker: B,

    /// The subscription registry.
    pub registry: R,

    /// Bound on each individual registry or broker call.
    pub step_timeout: Duration,
}

/// Coordinates subscription changes across a registry and a broker.
#[derive(Clone)]
pub struct SubscriptionCoordinator<R, B>
where
    R: Registry,
    B: Broker,
{
    broker: B,
    registry: R,
    step_timeout: Duration,
}

/// Failure of a single bounded step.
#[derive(Debug)]
enum StepError<E> {
    Failed(E),
    TimedOut(Duration),
}

impl<E: Display> Display for StepError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(after) => write!(f, "timed out after {after:?}"),
        }
    }
}

impl<E: RegistryError> StepError<E> {
    fn into_registry_error(self) -> Error {
        match self {
            Self::Failed(e) if !e.is_transient() => Error::Internal(e.to_string()),
            other => Error::RegistryUnavailable(other.to_string()),
        }
    }
}

impl<R, B> SubscriptionCoordinator<R, B>
where
    R: Registry,
    B: Broker,
{
    /// Creates a new coordinator over already-connected backends.
    pub fn new(
        SubscriptionCoordinatorOptions {
            broker,
            registry,
            step_timeout,
        }: SubscriptionCoordinatorOptions<R, B>,
    ) -> Self {
        Self {
            broker,
            registry,
            step_timeout,
        }
    }

    async fn step<T, E, F>(&self, fut: F) -> std::result::Result<T, StepError<E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(self.step_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(StepError::Failed(e)),
            Err(_) => Err(StepError::TimedOut(self.step_timeout)),
        }
    }

    fn binding(&self, operation: &SubscriptionOperation) -> BrokerBinding {
        BrokerBinding {
            exchange: self.broker.exchange().to_string(),
            queue_name: operation.queue_name(),
            routing_key: operation.topic.clone(),
        }
    }

    async fn apply_to_broker(
        &self,
        operation: &SubscriptionOperation,
        change: TopicChange,
    ) -> std::result::Result<(), StepError<B::Error>> {
        let queue_name = operation.queue_name();

        match operation.direction {
            Direction::Add => {
                self.step(self.broker.declare_queue(&queue_name)).await?;
                self.step(self.broker.bind(&queue_name, &operation.topic))
                    .await?;
                self.step(self.broker.bind(&queue_name, BROADCAST_ROUTING_KEY))
                    .await?;
            }
            Direction::Remove => {
                if !self.step(self.broker.queue_exists(&queue_name)).await? {
                    debug!(%queue_name, "queue absent, nothing to unbind");
                    return Ok(());
                }

                self.step(self.broker.unbind(&queue_name, &operation.topic))
                    .await?;

                // A user without topics stops receiving broadcasts too.
                if change.remaining == 0 {
                    self.step(self.broker.unbind(&queue_name, BROADCAST_ROUTING_KEY))
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn abort(&self, transaction: R::Transaction, operation: &SubscriptionOperation) {
        match self.step(transaction.abort()).await {
            Ok(()) => debug!(
                user_id = %operation.user_id,
                topic = %operation.topic,
                "registry transaction aborted"
            ),
            Err(e) => warn!(
                user_id = %operation.user_id,
                topic = %operation.topic,
                error = %e,
                "registry abort failed; uncommitted changes are discarded by the store"
            ),
        }
    }

    #[instrument(
        skip(self, operation),
        fields(
            user_id = %operation.user_id,
            topic = %operation.topic,
            direction = %operation.direction
        )
    )]
    async fn execute(&self, operation: SubscriptionOperation) -> Result<SubscriptionOutcome> {
        let mut transaction = self
            .step(self.registry.begin())
            .await
            .map_err(StepError::into_registry_error)?;

        let staged = match operation.direction {
            Direction::Add => {
                self.step(transaction.add_topic(&operation.user_id, &operation.topic))
                    .await
            }
            Direction::Remove => {
                self.step(transaction.remove_topic(&operation.user_id, &operation.topic))
                    .await
            }
        };

        let change = match staged {
            Ok(change) => change,
            Err(e) => {
                self.abort(transaction, &operation).await;
                return Err(e.into_registry_error());
            }
        };

        if let Err(e) = self.apply_to_broker(&operation, change).await {
            warn!(error = %e, "broker call failed, rolling back registry");
            self.abort(transaction, &operation).await;
            return Err(Error::BrokerBindingFailed {
                direction: operation.direction,
                binding: self.binding(&operation),
                reason: e.to_string(),
            });
        }

        if let Err(e) = self.step(transaction.commit()).await {
            error!(
                error = %e,
                binding = %self.binding(&operation),
                "registry commit failed after broker change; registry and broker disagree until retried"
            );
            return Err(Error::PartialFailure {
                user_id: operation.user_id,
                topic: operation.topic,
                direction: operation.direction,
                reason: e.to_string(),
            });
        }

        let outcome = operation.outcome(change.changed);
        if outcome.is_change() {
            info!(outcome = outcome.as_str(), "subscription updated");
        } else {
            debug!(outcome = outcome.as_str(), "subscription unchanged");
        }

        Ok(outcome)
    }

    async fn publish_with_key(&self, routing_key: &str, payload: Bytes) -> Result<()> {
        self.step(self.broker.publish(routing_key, payload))
            .await
            .map_err(|e| Error::PublishFailed {
                routing_key: routing_key.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl<R, B> SubscriptionManagement for SubscriptionCoordinator<R, B>
where
    R: Registry,
    B: Broker,
{
    async fn subscribe(&self, user_id: &str, topic: &str) -> Result<SubscriptionOutcome> {
        let operation = SubscriptionOperation::new(user_id, topic, Direction::Add)?;
        self.execute(operation).await
    }

    async fn unsubscribe(&self, user_id: &str, topic: &str) -> Result<SubscriptionOutcome> {
        let operation = SubscriptionOperation::new(user_id, topic, Direction::Remove)?;
        self.execute(operation).await
    }

    #[instrument(skip(self))]
    async fn subscriptions(&self, user_id: &str) -> Result<BTreeSet<String>> {
        validate_user_id(user_id)?;

        self.step(self.registry.topics(user_id))
            .await
            .map_err(StepError::into_registry_error)
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        validate_topic(topic)?;
        self.publish_with_key(topic, payload).await
    }

    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    async fn broadcast(&self, payload: Bytes) -> Result<()> {
        self.publish_with_key(BROADCAST_ROUTING_KEY, payload).await
    }
}
