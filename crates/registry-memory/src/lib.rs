//! In-memory (single node) implementation of the subscription registry for
//! local development and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use herald_registry::{Registry, RegistryTransaction, SubscriptionRecord, TopicChange};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Faults {
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_read: AtomicBool,
    commit_delay_ms: AtomicU64,
}

/// In-memory subscription registry.
///
/// Each transaction holds an exclusive lock on every record it touches until
/// it commits or aborts, so overlapping operations on the same user are
/// serialised while different users proceed independently.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    documents: Arc<Mutex<HashMap<String, BTreeSet<String>>>>,
    document_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    faults: Arc<Faults>,
}

impl MemoryRegistry {
    /// Creates a new, empty `MemoryRegistry`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent [`Registry::begin`] fail while `fail` is set.
    pub fn fail_begin(&self, fail: bool) {
        self.faults.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent commit fail while `fail` is set.
    pub fn fail_commits(&self, fail: bool) {
        self.faults.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent point read fail while `fail` is set.
    pub fn fail_reads(&self, fail: bool) {
        self.faults.fail_read.store(fail, Ordering::SeqCst);
    }

    /// Delays every subsequent commit by `delay`.
    pub fn set_commit_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.commit_delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn lock_document(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.document_locks
                .entry(user_id.to_string())
                .or_default()
                .value(),
        );

        lock.lock_owned().await
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    type Error = Error;
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        if self.faults.fail_begin.load(Ordering::SeqCst) {
            return Err(Error::BeginFailed);
        }

        Ok(MemoryTransaction {
            registry: self.clone(),
            guards: HashMap::new(),
            staged: HashMap::new(),
        })
    }

    async fn record(&self, user_id: &str) -> Result<Option<SubscriptionRecord>, Self::Error> {
        if self.faults.fail_read.load(Ordering::SeqCst) {
            return Err(Error::ReadFailed);
        }

        Ok(self
            .documents
            .lock()
            .await
            .get(user_id)
            .map(|topics| SubscriptionRecord {
                user_id: user_id.to_string(),
                topics: topics.clone(),
            }))
    }
}

#[derive(Debug)]
struct StagedRecord {
    topics: BTreeSet<String>,
    existed: bool,
    dirty: bool,
}

/// A transaction against a [`MemoryRegistry`].
#[derive(Debug)]
pub struct MemoryTransaction {
    registry: MemoryRegistry,
    guards: HashMap<String, OwnedMutexGuard<()>>,
    staged: HashMap<String, StagedRecord>,
}

impl MemoryTransaction {
    async fn staged_record(&mut self, user_id: &str) -> &mut StagedRecord {
        if !self.guards.contains_key(user_id) {
            let guard = self.registry.lock_document(user_id).await;
            self.guards.insert(user_id.to_string(), guard);

            let committed = self.registry.documents.lock().await.get(user_id).cloned();
            self.staged.insert(
                user_id.to_string(),
                StagedRecord {
                    existed: committed.is_some(),
                    topics: committed.unwrap_or_default(),
                    dirty: false,
                },
            );
        }

        self.staged
            .entry(user_id.to_string())
            .or_insert_with(|| StagedRecord {
                topics: BTreeSet::new(),
                existed: false,
                dirty: false,
            })
    }
}

#[async_trait]
impl RegistryTransaction for MemoryTransaction {
    type Error = Error;

    async fn add_topic(
        &mut self,
        user_id: &str,
        topic: &str,
    ) -> Result<TopicChange, Self::Error> {
        let staged = self.staged_record(user_id).await;
        let changed = staged.topics.insert(topic.to_string());
        staged.dirty |= changed || !staged.existed;

        Ok(TopicChange {
            changed,
            remaining: staged.topics.len(),
        })
    }

    async fn remove_topic(
        &mut self,
        user_id: &str,
        topic: &str,
    ) -> Result<TopicChange, Self::Error> {
        let staged = self.staged_record(user_id).await;
        let changed = staged.topics.remove(topic);
        staged.dirty |= changed;

        Ok(TopicChange {
            changed,
            remaining: staged.topics.len(),
        })
    }

    async fn commit(mut self) -> Result<(), Self::Error> {
        let delay = self.registry.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.registry.faults.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::CommitFailed);
        }

        let mut documents = self.registry.documents.lock().await;
        for (user_id, staged) in std::mem::take(&mut self.staged) {
            if staged.dirty {
                debug!(%user_id, topics = staged.topics.len(), "committing record");
                documents.insert(user_id, staged.topics);
            }
        }
        drop(documents);

        Ok(())
    }

    async fn abort(self) -> Result<(), Self::Error> {
        debug!(records = self.staged.len(), "aborting transaction");
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        for (user_id, guard) in self.guards.drain() {
            drop(guard);

            // Forget the lock once no other transaction holds or awaits it.
            self.registry
                .document_locks
                .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}
