//! presencebot: keeps bot accounts looking active by repeating a chat action
//! in every conversation that recently received a message.

pub mod api;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod messaging;
pub mod presence;
pub mod supervisor;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bot identity identifier type.
pub type BotId = Arc<str>;

/// Inbound event from a messaging platform, reduced to the fields needed to
/// address a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform update identifier.
    pub id: String,
    pub kind: EventKind,
    /// The chat the event happened in. None for updates that are not tied to
    /// a chat (inline queries, polls, ...).
    pub chat: Option<ChatRef>,
    pub sender: Option<Sender>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Kinds of inbound events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    EditedMessage,
    ChannelPost,
    Other,
}

impl EventKind {
    /// Whether events of this kind always belong to a conversation.
    pub fn is_addressable(self) -> bool {
        !matches!(self, EventKind::Other)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Message => write!(f, "message"),
            EventKind::EditedMessage => write!(f, "edited_message"),
            EventKind::ChannelPost => write!(f, "channel_post"),
            EventKind::Other => write!(f, "other"),
        }
    }
}

/// A chat reference carried by an inbound event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRef {
    pub id: i64,
    pub kind: ChatKind,
}

/// Chat types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl std::fmt::Display for ChatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatKind::Private => write!(f, "private"),
            ChatKind::Group => write!(f, "group"),
            ChatKind::Supergroup => write!(f, "supergroup"),
            ChatKind::Channel => write!(f, "channel"),
        }
    }
}

/// Sender of an inbound event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    pub id: u64,
    pub is_bot: bool,
}

/// Profile of the connected bot account, learned when the transport connects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotProfile {
    pub user_id: u64,
    pub username: Option<String>,
}
