//! Shared chat data model for the Arbor host.
//!
//! These types are the payload threaded through the plugin pipeline: a
//! [`ChatContext`] carries the conversation into `process_request`, each
//! pipeline stage transforms it in place, and the selected backend produces
//! a [`ChatReply`] (a single message or a lazy stream of text fragments).

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message.
    System,
    /// User message.
    #[default]
    User,
    /// Assistant message.
    Assistant,
    /// Tool message.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role.
    pub role: Role,
    /// Content.
    pub content: String,
    /// Name (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }
}

/// Mutable request payload threaded through the pipeline.
///
/// Owned by the caller of `process_request` for the duration of one request;
/// each pipeline stage transforms it in place.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatContext {
    /// Conversation so far, oldest first.
    pub messages: Vec<Message>,

    /// Requested model identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Whether the caller wants a streaming reply.
    #[serde(default)]
    pub stream: bool,

    /// Free-form request metadata (pipeline stages may read and write).
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ChatContext {
    /// Create a context from an initial set of messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// The most recent user message, if any.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// Append a message to the conversation.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}

/// A lazy, single-pass, non-restartable sequence of text fragments.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String, String>> + Send>>;

/// Backend reply: a single message, or a stream of fragments.
pub enum ChatReply {
    /// Complete assistant message.
    Message(Message),
    /// Streaming fragments; consumed exactly once.
    Stream(ChatStream),
}

impl std::fmt::Debug for ChatReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").field(&"..").finish(),
        }
    }
}
