use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end-user that started the session.
    User,
    /// The engine speaking on behalf of the assistant (final responses).
    Assistant,
    /// Engine-generated progress notes.
    System,
    /// A human approver resuming an interrupt.
    Approver,
}

/// A single entry in a session's conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
    /// Who produced the entry (`"user"`, `"engine"`, a capability or reviewer name).
    pub origin: String,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary key-value metadata attached to the message.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a new message with the given role, content and origin.
    pub fn new(role: Role, content: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            origin: origin.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, "user")
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, "engine")
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, "engine")
    }

    /// Creates a new message with [`Role::Approver`] authored by `reviewer`.
    pub fn approver(content: impl Into<String>, reviewer: impl Into<String>) -> Self {
        Self::new(Role::Approver, content, reviewer)
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
