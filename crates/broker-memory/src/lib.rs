//! In-memory (single node) topic exchange for local development and tests.
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
use bytes::Bytes;
use herald_broker::{Broker, BrokerBinding, routing_key_matches};
use parking_lot::RwLock;
use tracing::debug;

/// A message delivered to a queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    /// The routing key the message was published with.
    pub routing_key: String,

    /// The message body.
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct Queue {
    bindings: BTreeSet<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_management: AtomicBool,
    fail_publish: AtomicBool,
    management_delay_ms: AtomicU64,
}

/// In-memory topic exchange with durable-queue semantics for the life of the
/// process.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    exchange: String,
    queues: Arc<RwLock<HashMap<String, Queue>>>,
    faults: Arc<Faults>,
}

impl MemoryBroker {
    /// Creates a new `MemoryBroker` with the given exchange name.
    #[must_use]
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queues: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Makes every subsequent declare/bind/unbind fail while `fail` is set.
    pub fn fail_management(&self, fail: bool) {
        self.faults.fail_management.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent publish fail while `fail` is set.
    pub fn fail_publishes(&self, fail: bool) {
        self.faults.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delays every subsequent declare/bind/unbind by `delay`.
    pub fn set_management_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.management_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Whether a queue has been declared.
    #[must_use]
    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.queues.read().contains_key(queue_name)
    }

    /// All bindings currently on the exchange.
    #[must_use]
    pub fn bindings(&self) -> Vec<BrokerBinding> {
        let queues = self.queues.read();
        let mut bindings: Vec<BrokerBinding> = queues
            .iter()
            .flat_map(|(queue_name, queue)| {
                queue.bindings.iter().map(|routing_key| BrokerBinding {
                    exchange: self.exchange.clone(),
                    queue_name: queue_name.clone(),
                    routing_key: routing_key.clone(),
                })
            })
            .collect();
        bindings.sort();
        bindings
    }

    /// Routing keys a queue is bound with. Empty if the queue does not exist.
    #[must_use]
    pub fn queue_bindings(&self, queue_name: &str) -> BTreeSet<String> {
        self.queues
            .read()
            .get(queue_name)
            .map(|queue| queue.bindings.clone())
            .unwrap_or_default()
    }

    /// Messages delivered to a queue so far.
    #[must_use]
    pub fn messages(&self, queue_name: &str) -> Vec<Message> {
        self.queues
            .read()
            .get(queue_name)
            .map(|queue| queue.messages.clone())
            .unwrap_or_default()
    }

    async fn before_management(
        &self,
        operation: &'static str,
        queue_name: &str,
    ) -> Result<(), Error> {
        let delay = self.faults.management_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.faults.fail_management.load(Ordering::SeqCst) {
            return Err(Error::Management {
                operation,
                queue_name: queue_name.to_string(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Error = Error;

    fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn declare_queue(&self, queue_name: &str) -> Result<(), Self::Error> {
        self.before_management("declare_queue", queue_name).await?;

        self.queues
            .write()
            .entry(queue_name.to_string())
            .or_default();

        Ok(())
    }

    async fn queue_exists(&self, queue_name: &str) -> Result<bool, Self::Error> {
        self.before_management("queue_exists", queue_name).await?;

        Ok(self.has_queue(queue_name))
    }

    async fn bind(&self, queue_name: &str, routing_key: &str) -> Result<(), Self::Error> {
        self.before_management("bind", queue_name).await?;

        let mut queues = self.queues.write();
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        if queue.bindings.insert(routing_key.to_string()) {
            debug!(queue_name, routing_key, "binding created");
        }

        Ok(())
    }

    async fn unbind(&self, queue_name: &str, routing_key: &str) -> Result<(), Self::Error> {
        self.before_management("unbind", queue_name).await?;

        let mut queues = self.queues.write();
        let queue = queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        if queue.bindings.remove(routing_key) {
            debug!(queue_name, routing_key, "binding removed");
        }

        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), Self::Error> {
        if self.faults.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::Publish(routing_key.to_string()));
        }

        let mut delivered = 0usize;
        let mut queues = self.queues.write();
        for queue in queues.values_mut() {
            if queue
                .bindings
                .iter()
                .any(|pattern| routing_key_matches(pattern, routing_key))
            {
                queue.messages.push(Message {
                    routing_key: routing_key.to_string(),
                    payload: payload.clone(),
                });
                delivered += 1;
            }
        }
        drop(queues);

        debug!(routing_key, delivered, "message published");

        Ok(())
    }
}
