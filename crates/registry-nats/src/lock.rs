use crate::error::Error;

use std::time::Duration;

use async_nats::jetstream::kv::{CreateErrorKind, Store as KvStore};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Exclusive lease on one record, held in the lock bucket until released.
///
/// The lock bucket's `max_age` expires leases whose holder vanished without
/// releasing them.
pub struct RecordLock {
    kv_store: KvStore,
    key: String,
    revision: u64,
    released: bool,
}

impl RecordLock {
    /// Waits up to `wait` for the lease on `key`.
    pub async fn acquire(
        kv_store: &KvStore,
        key: &str,
        holder: &Bytes,
        wait: Duration,
    ) -> Result<Self, Error> {
        let deadline = Instant::now() + wait;
        let mut poll_interval = INITIAL_POLL_INTERVAL;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt = tokio::time::timeout(remaining, kv_store.create(key, holder.clone()))
                .await
                .map_err(|_| Error::LockTimeout {
                    key: key.to_string(),
                    waited: wait,
                })?;

            match attempt {
                Ok(revision) => {
                    debug!(key, revision, "record lock acquired");
                    return Ok(Self {
                        kv_store: kv_store.clone(),
                        key: key.to_string(),
                        revision,
                        released: false,
                    });
                }
                Err(e) if matches!(e.kind(), CreateErrorKind::AlreadyExists) => {}
                Err(e) => return Err(Error::Create(e)),
            }

            if Instant::now() + poll_interval >= deadline {
                return Err(Error::LockTimeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }

            tokio::time::sleep(poll_interval).await;
            poll_interval = std::cmp::min(
                poll_interval.mul_f64(fastrand::f64().mul_add(0.1, 1.5)),
                MAX_POLL_INTERVAL,
            );
        }
    }

    /// Releases the lease if it is still ours.
    pub async fn release(mut self) -> Result<(), Error> {
        self.released = true;

        self.kv_store
            .delete_expect_revision(&self.key, Some(self.revision))
            .await?;

        debug!(key = %self.key, "record lock released");

        Ok(())
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "record lock dropped outside a runtime; left to expire");
            return;
        };

        let kv_store = self.kv_store.clone();
        let key = std::mem::take(&mut self.key);
        let revision = self.revision;

        handle.spawn(async move {
            if let Err(e) = kv_store.delete_expect_revision(&key, Some(revision)).await {
                warn!(%key, error = %e, "failed to release dropped record lock");
            }
        });
    }
}
