use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error encoding or decoding a stored record.
#[derive(Debug, Error)]
pub enum RecordCodecError {
    /// The stored bytes are not a valid CBOR record.
    #[error("failed to decode subscription record: {0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    /// The record could not be serialized.
    #[error("failed to encode subscription record: {0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
}

/// The set of topics a single user is subscribed to.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubscriptionRecord {
    /// Opaque user identifier. Unique key of the record.
    pub user_id: String,

    /// Subscribed topic names.
    pub topics: BTreeSet<String>,
}

impl SubscriptionRecord {
    /// Creates an empty record for a user.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            topics: BTreeSet::new(),
        }
    }
}

impl TryFrom<Bytes> for SubscriptionRecord {
    type Error = RecordCodecError;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        Ok(ciborium::de::from_reader(bytes.as_ref())?)
    }
}

impl TryInto<Bytes> for SubscriptionRecord {
    type Error = RecordCodecError;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&self, &mut bytes)?;
        Ok(Bytes::from(bytes))
    }
}
