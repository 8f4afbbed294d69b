//! Abstract interface for durable user-to-topics subscription registries.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod record;

pub use record::{RecordCodecError, SubscriptionRecord};

use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for registry errors.
pub trait RegistryError: Debug + Error + Send + Sync + 'static {
    /// Whether the failure is a transient availability problem (network,
    /// timeout, contention) rather than a fault in the stored data.
    fn is_transient(&self) -> bool {
        true
    }
}

/// A durable mapping from user identity to a set of subscribed topics.
///
/// Mutations happen inside a [`RegistryTransaction`] so a caller can hold
/// them open while it performs side effects elsewhere, then commit or abort.
#[async_trait]
pub trait Registry: Clone + Send + Sync + 'static {
    /// The error type for registry operations.
    type Error: RegistryError;

    /// The transaction scope handed out by [`Registry::begin`].
    type Transaction: RegistryTransaction<Error = Self::Error>;

    /// Opens a new transaction scope.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Reads the committed record for a user, if one exists.
    async fn record(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, Self::Error>;

    /// Reads the committed topic set for a user. Missing records read as empty.
    async fn topics(&self, user_id: &str) -> Result<BTreeSet<String>, Self::Error> {
        Ok(self
            .record(user_id)
            .await?
            .map(|record| record.topics)
            .unwrap_or_default())
    }
}

/// The staged effect of a single topic mutation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TopicChange {
    /// Whether the user's topic set changed.
    pub changed: bool,

    /// Size of the user's staged topic set after the mutation.
    pub remaining: usize,
}

/// An open transaction against a [`Registry`].
///
/// Nothing staged in a transaction is visible to readers until
/// [`RegistryTransaction::commit`] succeeds. Dropping a transaction without
/// committing is equivalent to aborting it.
///
/// Once a transaction has staged a mutation for a user, no other transaction
/// may stage one for that user until the first commits or aborts.
#[async_trait]
pub trait RegistryTransaction: Send + 'static {
    /// The error type for transaction operations.
    type Error: RegistryError;

    /// Adds `topic` to the user's topic set, creating the record if needed.
    async fn add_topic(&mut self, user_id: &str, topic: &str) -> Result<TopicChange, Self::Error>;

    /// Removes `topic` from the user's topic set. Never creates a record.
    async fn remove_topic(
        &mut self,
        user_id: &str,
        topic: &str,
    ) -> Result<TopicChange, Self::Error>;

    /// Makes every staged mutation durable.
    async fn commit(self) -> Result<(), Self::Error>;

    /// Discards every staged mutation.
    async fn abort(self) -> Result<(), Self::Error>;
}
