use crate::error::{Error, Result};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Routing key every per-user queue is bound with, so a single publish
/// reaches all subscribers. Topics cannot contain `.`, so it never collides
/// with a topic name.
pub const BROADCAST_ROUTING_KEY: &str = "broadcast.all";

const MAX_IDENTIFIER_BYTES: usize = 200;

/// Whether a subscription is being added or removed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    /// Subscribe.
    Add,

    /// Unsubscribe.
    Remove,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Add => write!(f, "subscribe"),
            Self::Remove => write!(f, "unsubscribe"),
        }
    }
}

/// The result of a successful subscribe or unsubscribe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SubscriptionOutcome {
    /// The topic was newly added.
    Added,

    /// The topic was already subscribed; nothing changed.
    AlreadyPresent,

    /// The topic was removed.
    Removed,

    /// The topic was not subscribed; nothing changed.
    NotPresent,
}

impl SubscriptionOutcome {
    /// Snake-case name of the outcome.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::AlreadyPresent => "already_present",
            Self::Removed => "removed",
            Self::NotPresent => "not_present",
        }
    }

    /// Whether the registry actually changed.
    #[must_use]
    pub const fn is_change(self) -> bool {
        matches!(self, Self::Added | Self::Removed)
    }
}

/// A single validated subscribe or unsubscribe request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionOperation {
    /// The user being (un)subscribed.
    pub user_id: String,

    /// The topic being (un)subscribed.
    pub topic: String,

    /// Add or remove.
    pub direction: Direction,
}

impl SubscriptionOperation {
    /// Validates the arguments and builds an operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the user id or topic is malformed.
    pub fn new(user_id: &str, topic: &str, direction: Direction) -> Result<Self> {
        validate_user_id(user_id)?;
        validate_topic(topic)?;

        Ok(Self {
            user_id: user_id.to_string(),
            topic: topic.to_string(),
            direction,
        })
    }

    /// The queue owned by this operation's user.
    #[must_use]
    pub fn queue_name(&self) -> String {
        queue_name(&self.user_id)
    }

    /// Maps whether the registry changed to the outcome reported to callers.
    #[must_use]
    pub const fn outcome(&self, changed: bool) -> SubscriptionOutcome {
        match (self.direction, changed) {
            (Direction::Add, true) => SubscriptionOutcome::Added,
            (Direction::Add, false) => SubscriptionOutcome::AlreadyPresent,
            (Direction::Remove, true) => SubscriptionOutcome::Removed,
            (Direction::Remove, false) => SubscriptionOutcome::NotPresent,
        }
    }
}

/// The per-user queue name.
#[must_use]
pub fn queue_name(user_id: &str) -> String {
    format!("queue_{user_id}")
}

/// Checks a user id: non-empty, bounded, no whitespace or control characters.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] describing the first problem found.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(Error::InvalidArgument("user id must not be empty".to_string()));
    }

    if user_id.len() > MAX_IDENTIFIER_BYTES {
        return Err(Error::InvalidArgument(format!(
            "user id longer than {MAX_IDENTIFIER_BYTES} bytes"
        )));
    }

    if user_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidArgument(
            "user id must not contain whitespace or control characters".to_string(),
        ));
    }

    Ok(())
}

/// Checks a topic: non-empty, bounded, ASCII alphanumerics, `-` and `_` only.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] describing the first problem found.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::InvalidArgument("topic must not be empty".to_string()));
    }

    if topic.len() > MAX_IDENTIFIER_BYTES {
        return Err(Error::InvalidArgument(format!(
            "topic longer than {MAX_IDENTIFIER_BYTES} bytes"
        )));
    }

    if let Some(c) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::InvalidArgument(format!(
            "topic contains disallowed character {c:?}"
        )));
    }

    Ok(())
}
