//! Implementation of the subscription registry on a NATS `JetStream` KV bucket.
//!
//! A transaction leases every record it touches from a companion lock bucket,
//! so no other transaction can stage the same user until it commits or
//! aborts. Mutations are buffered locally and published at commit time with a
//! revision compare-and-swap. If a writer outside the lease protocol wins the
//! race, the set mutations are replayed on top of the fresh record.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod lock;

pub use error::Error;

use lock::RecordLock;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::Context as JetStreamContext;
use async_nats::jetstream::kv::{
    Config as KvConfig, CreateErrorKind, Operation, Store as KvStore, UpdateErrorKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use herald_registry::{Registry, RegistryTransaction, SubscriptionRecord, TopicChange};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Options for configuring a `NatsRegistry`.
#[derive(Clone, Debug)]
pub struct NatsRegistryOptions {
    /// The KV bucket holding subscription records.
    pub bucket: String,

    /// The NATS client to use.
    pub client: Client,

    /// Number of replicas for the KV bucket. Use at least 3 in production.
    pub num_replicas: usize,

    /// Whether to persist the bucket to disk.
    pub persist: bool,

    /// Timeout for individual NATS operations. Defaults to 10 seconds.
    pub operation_timeout: Option<Duration>,

    /// Maximum compare-and-swap attempts per committed record. Defaults to 5.
    pub max_commit_attempts: Option<usize>,

    /// Age after which an unreleased record lock expires. Defaults to 30 seconds.
    pub lock_ttl: Option<Duration>,

    /// How long a transaction waits for another to release a record. Defaults
    /// to 10 seconds.
    pub lock_wait: Option<Duration>,
}

/// Subscription registry backed by NATS `JetStream` KV.
#[derive(Clone, Debug)]
pub struct NatsRegistry {
    bucket: String,
    holder: Bytes,
    jetstream_context: JetStreamContext,
    kv_store: Arc<OnceCell<KvStore>>,
    lock_store: Arc<OnceCell<KvStore>>,
    lock_ttl: Duration,
    lock_wait: Duration,
    max_commit_attempts: usize,
    num_replicas: usize,
    operation_timeout: Duration,
    persist: bool,
}

impl NatsRegistry {
    /// Creates a new `NatsRegistry`. The bucket is created lazily on first use.
    #[must_use]
    pub fn new(
        NatsRegistryOptions {
            bucket,
            client,
            num_replicas,
            persist,
            operation_timeout,
            max_commit_attempts,
            lock_ttl,
            lock_wait,
        }: NatsRegistryOptions,
    ) -> Self {
        Self {
            bucket,
            holder: Bytes::from(format!("herald-{:016x}", fastrand::u64(..))),
            jetstream_context: async_nats::jetstream::new(client),
            kv_store: Arc::new(OnceCell::new()),
            lock_store: Arc::new(OnceCell::new()),
            lock_ttl: lock_ttl.unwrap_or(Duration::from_secs(30)),
            lock_wait: lock_wait.unwrap_or(Duration::from_secs(10)),
            max_commit_attempts: max_commit_attempts.unwrap_or(5).max(1),
            num_replicas,
            operation_timeout: operation_timeout.unwrap_or(Duration::from_secs(10)),
            persist,
        }
    }

    async fn with_timeout<F, R, E>(&self, operation: &'static str, fut: F) -> Result<R, Error>
    where
        F: Future<Output = Result<R, E>>,
        Error: From<E>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::Timeout { operation }),
        }
    }

    async fn open_bucket(
        &self,
        cell: &OnceCell<KvStore>,
        bucket: String,
        max_age: Duration,
    ) -> Result<KvStore, Error> {
        cell.get_or_try_init(|| async {
            let config = KvConfig {
                bucket: bucket.clone(),
                max_age,
                num_replicas: self.num_replicas,
                storage: if self.persist {
                    async_nats::jetstream::stream::StorageType::File
                } else {
                    async_nats::jetstream::stream::StorageType::Memory
                },
                ..Default::default()
            };

            let jetstream_context = self.jetstream_context.clone();
            let kv_store = self
                .with_timeout(
                    "create_or_update_kv",
                    jetstream_context.create_or_update_key_value(config),
                )
                .await?;

            info!(%bucket, "registry bucket ready");

            Ok::<_, Error>(kv_store)
        })
        .await
        .cloned()
    }

    async fn get_kv_store(&self) -> Result<KvStore, Error> {
        self.open_bucket(&self.kv_store, self.bucket.clone(), Duration::ZERO)
            .await
    }

    async fn get_lock_store(&self) -> Result<KvStore, Error> {
        self.open_bucket(
            &self.lock_store,
            format!("{}_locks", self.bucket),
            self.lock_ttl,
        )
        .await
    }

    async fn read_entry(
        &self,
        kv_store: &KvStore,
        key: &str,
    ) -> Result<(Option<u64>, Option<SubscriptionRecord>), Error> {
        let entry = self.with_timeout("kv_entry", kv_store.entry(key)).await?;

        match entry {
            Some(entry) if matches!(entry.operation, Operation::Put) => {
                let record = SubscriptionRecord::try_from(entry.value).map_err(|source| {
                    Error::Corrupt {
                        key: key.to_string(),
                        source,
                    }
                })?;
                Ok((Some(entry.revision), Some(record)))
            }
            // Deleted or purged keys can be recreated with `create`.
            _ => Ok((None, None)),
        }
    }
}

/// KV keys only allow a restricted alphabet, so user ids are hex encoded.
fn record_key(user_id: &str) -> String {
    hex::encode(user_id)
}

#[async_trait]
impl Registry for NatsRegistry {
    type Error = Error;
    type Transaction = NatsTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        let kv_store = self.get_kv_store().await?;
        let lock_store = self.get_lock_store().await?;

        Ok(NatsTransaction {
            registry: self.clone(),
            kv_store,
            lock_store,
            locks: HashMap::new(),
            staged: HashMap::new(),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn record(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, Self::Error> {
        let kv_store = self.get_kv_store().await?;
        let (_, record) = self.read_entry(&kv_store, &record_key(user_id)).await?;

        Ok(record)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Mutation {
    Add(String),
    Remove(String),
}

fn apply_mutations(base: &BTreeSet<String>, mutations: &[Mutation]) -> BTreeSet<String> {
    let mut topics = base.clone();
    for mutation in mutations {
        match mutation {
            Mutation::Add(topic) => {
                topics.insert(topic.clone());
            }
            Mutation::Remove(topic) => {
                topics.remove(topic);
            }
        }
    }
    topics
}

#[derive(Debug)]
struct StagedRecord {
    user_id: String,
    revision: Option<u64>,
    existed: bool,
    base: BTreeSet<String>,
    mutations: Vec<Mutation>,
}

impl StagedRecord {
    fn current(&self) -> BTreeSet<String> {
        apply_mutations(&self.base, &self.mutations)
    }

    fn needs_write(&self) -> bool {
        let creates = !self.existed
            && self
                .mutations
                .iter()
                .any(|mutation| matches!(mutation, Mutation::Add(_)));
        creates || (self.existed && self.current() != self.base)
    }
}

/// A buffered transaction against a [`NatsRegistry`].
pub struct NatsTransaction {
    registry: NatsRegistry,
    kv_store: KvStore,
    lock_store: KvStore,
    locks: HashMap<String, RecordLock>,
    staged: HashMap<String, StagedRecord>,
}

impl NatsTransaction {
    async fn staged_record(&mut self, user_id: &str) -> Result<&mut StagedRecord, Error> {
        let key = record_key(user_id);

        if !self.staged.contains_key(&key) {
            let lock = RecordLock::acquire(
                &self.lock_store,
                &key,
                &self.registry.holder,
                self.registry.lock_wait,
            )
            .await?;
            self.locks.insert(key.clone(), lock);

            let (revision, record) = self.registry.read_entry(&self.kv_store, &key).await?;
            self.staged.insert(
                key.clone(),
                StagedRecord {
                    user_id: user_id.to_string(),
                    revision,
                    existed: record.is_some(),
                    base: record.map(|r| r.topics).unwrap_or_default(),
                    mutations: Vec::new(),
                },
            );
        }

        Ok(self.staged.entry(key).or_insert_with(|| StagedRecord {
            user_id: user_id.to_string(),
            revision: None,
            existed: false,
            base: BTreeSet::new(),
            mutations: Vec::new(),
        }))
    }

    async fn write(&self, key: &str, staged: &StagedRecord) -> Result<Option<u64>, Error> {
        let record = SubscriptionRecord {
            user_id: staged.user_id.clone(),
            topics: staged.current(),
        };
        let bytes: Bytes = record.try_into().map_err(Error::Encode)?;

        let result = match staged.revision {
            Some(revision) => {
                let outcome = tokio::time::timeout(
                    self.registry.operation_timeout,
                    self.kv_store.update(key, bytes, revision),
                )
                .await
                .map_err(|_| Error::Timeout {
                    operation: "kv_update",
                })?;

                match outcome {
                    Ok(revision) => Some(revision),
                    Err(e) if matches!(e.kind(), UpdateErrorKind::WrongLastRevision) => None,
                    Err(e) => return Err(Error::Update(e)),
                }
            }
            None => {
                let outcome = tokio::time::timeout(
                    self.registry.operation_timeout,
                    self.kv_store.create(key, bytes),
                )
                .await
                .map_err(|_| Error::Timeout {
                    operation: "kv_create",
                })?;

                match outcome {
                    Ok(revision) => Some(revision),
                    Err(e) if matches!(e.kind(), CreateErrorKind::AlreadyExists) => None,
                    Err(e) => return Err(Error::Create(e)),
                }
            }
        };

        Ok(result)
    }

    async fn release_locks(&mut self) {
        for (key, lock) in self.locks.drain() {
            if let Err(e) = lock.release().await {
                warn!(%key, error = %e, "failed to release record lock; it expires on its own");
            }
        }
    }

    #[instrument(skip(self, staged), fields(user_id = %staged.user_id))]
    async fn commit_record(&self, key: &str, mut staged: StagedRecord) -> Result<(), Error> {
        let mut delay = Duration::from_millis(10);

        for attempt in 1..=self.registry.max_commit_attempts {
            if !staged.needs_write() {
                debug!(attempt, "record already in desired state");
                return Ok(());
            }

            if let Some(revision) = self.write(key, &staged).await? {
                debug!(attempt, revision, "record committed");
                return Ok(());
            }

            warn!(attempt, "revision race while committing record, replaying");

            let (revision, record) = self.registry.read_entry(&self.kv_store, key).await?;
            staged.revision = revision;
            staged.existed = record.is_some();
            staged.base = record.map(|r| r.topics).unwrap_or_default();

            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(fastrand::f64().mul_add(0.1, 2.0));
        }

        Err(Error::Contention {
            key: key.to_string(),
            attempts: self.registry.max_commit_attempts,
        })
    }
}

#[async_trait]
impl RegistryTransaction for NatsTransaction {
    type Error = Error;

    async fn add_topic(
        &mut self,
        user_id: &str,
        topic: &str,
    ) -> Result<TopicChange, Self::Error> {
        let staged = self.staged_record(user_id).await?;
        let changed = !staged.current().contains(topic);
        staged.mutations.push(Mutation::Add(topic.to_string()));

        Ok(TopicChange {
            changed,
            remaining: staged.current().len(),
        })
    }

    async fn remove_topic(
        &mut self,
        user_id: &str,
        topic: &str,
    ) -> Result<TopicChange, Self::Error> {
        let staged = self.staged_record(user_id).await?;
        let changed = staged.current().contains(topic);
        staged.mutations.push(Mutation::Remove(topic.to_string()));

        Ok(TopicChange {
            changed,
            remaining: staged.current().len(),
        })
    }

    async fn commit(mut self) -> Result<(), Self::Error> {
        let staged = std::mem::take(&mut self.staged);

        let mut result = Ok(());
        for (key, record) in staged {
            if let Err(e) = self.commit_record(&key, record).await {
                result = Err(e);
                break;
            }
        }

        self.release_locks().await;

        result
    }

    async fn abort(mut self) -> Result<(), Self::Error> {
        // Nothing reaches the bucket before commit.
        debug!(records = self.staged.len(), "discarding buffered transaction");
        self.release_locks().await;

        Ok(())
    }
}
