use herald_registry::{RecordCodecError, RegistryError};
use thiserror::Error;

/// Errors that can occur when using the NATS registry.
#[derive(Debug, Error)]
pub enum Error {
    /// Error creating or opening the KV bucket.
    #[error("NATS JetStream context error opening KV bucket: {0}")]
    CreateKv(#[from] async_nats::jetstream::context::CreateKeyValueError),

    /// Error creating a record.
    #[error("NATS KV create error: {0}")]
    Create(#[from] async_nats::jetstream::kv::CreateError),

    /// Error releasing a record lock.
    #[error("NATS KV delete error: {0}")]
    Delete(#[from] async_nats::jetstream::kv::DeleteError),

    /// Error reading a record.
    #[error("NATS KV entry error: {0}")]
    Entry(#[from] async_nats::jetstream::kv::EntryError),

    /// Error updating a record.
    #[error("NATS KV update error: {0}")]
    Update(async_nats::jetstream::kv::UpdateError),

    /// A stored record could not be decoded.
    #[error("corrupt subscription record for key {key}: {source}")]
    Corrupt {
        /// The KV key holding the record.
        key: String,
        /// The decoding failure.
        source: RecordCodecError,
    },

    /// A record could not be encoded.
    #[error(transparent)]
    Encode(RecordCodecError),

    /// Compare-and-swap kept losing to concurrent writers.
    #[error("commit for key {key} lost {attempts} revision races")]
    Contention {
        /// The KV key being committed.
        key: String,
        /// Number of attempts made.
        attempts: usize,
    },

    /// Another transaction held the record for longer than the lock wait.
    #[error("record {key} still locked after {waited:?}")]
    LockTimeout {
        /// The KV key of the contended record.
        key: String,
        /// How long this transaction waited.
        waited: std::time::Duration,
    },

    /// A NATS operation did not finish in time.
    #[error("NATS operation {operation} timed out")]
    Timeout {
        /// Name of the operation that timed out.
        operation: &'static str,
    },
}

impl RegistryError for Error {
    fn is_transient(&self) -> bool {
        !matches!(self, Self::Corrupt { .. } | Self::Encode(_))
    }
}
