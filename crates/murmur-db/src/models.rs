//! Database row types. These map directly to SQLite rows.
//! Distinct from murmur-types API models to keep the DB layer independent.

use murmur_types::models::{
    AdminMessage, AdminUserOverview, ConversationMessage, Message, MessageStatus, User,
    UserSummary,
};
use tracing::warn;

use crate::parse_ts;

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub avatar: String,
    pub online: bool,
    pub last_seen: String,
    pub connection_id: Option<String>,
    pub message_color: Option<String>,
    pub created_at: String,
}

impl UserRow {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            username: self.username,
            avatar: self.avatar,
            online: self.online,
            last_seen: parse_ts(&self.last_seen),
            message_color: self.message_color,
            created_at: parse_ts(&self.created_at),
        }
    }

    pub fn into_summary(self) -> UserSummary {
        self.into_user().into()
    }
}

/// A user row joined with its message counts, for the admin surface.
pub struct UserStatsRow {
    pub id: i64,
    pub username: String,
    pub avatar: String,
    pub online: bool,
    pub last_seen: String,
    pub message_color: Option<String>,
    pub messages_sent: i64,
    pub messages_received: i64,
}

impl UserStatsRow {
    pub fn into_overview(self) -> AdminUserOverview {
        AdminUserOverview {
            id: self.id,
            username: self.username,
            avatar: self.avatar,
            online: self.online,
            last_seen: parse_ts(&self.last_seen),
            message_color: self.message_color,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
        }
    }
}

pub struct MessageRow {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub body: String,
    pub timestamp: String,
    pub status: String,
    pub color: Option<String>,
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        let status = self.status.parse().unwrap_or_else(|e| {
            warn!("Corrupt status on message {}: {}", self.id, e);
            MessageStatus::Sent
        });
        Message {
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.body,
            timestamp: parse_ts(&self.timestamp),
            status,
            color: self.color,
        }
    }
}

pub struct ConversationRow {
    pub message: MessageRow,
    pub sender_name: String,
    pub sender_avatar: String,
}

impl ConversationRow {
    pub fn into_conversation_message(self) -> ConversationMessage {
        ConversationMessage {
            message: self.message.into_message(),
            sender_name: self.sender_name,
            sender_avatar: self.sender_avatar,
        }
    }
}

pub struct AdminMessageRow {
    pub message: MessageRow,
    pub sender_name: String,
    pub receiver_name: String,
}

impl AdminMessageRow {
    pub fn into_admin_message(self) -> AdminMessage {
        AdminMessage {
            message: self.message.into_message(),
            sender_name: self.sender_name,
            receiver_name: self.receiver_name,
        }
    }
}

/// Result of an update that can collide with the unique username index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    NotFound,
    Conflict,
}

/// Result of a forward-only status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub previous: MessageStatus,
    pub current: MessageStatus,
}

impl StatusTransition {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}
