use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type MessageId = i64;

/// Avatar reference every account starts with.
pub const DEFAULT_AVATAR: &str = "default.png";

/// Full user record as the core sees it. The credential hash is deliberately
/// absent; it only leaves the store through the admin detail query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub message_color: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Public listing entry, pushed to every connection on `UsersListUpdated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

impl From<User> for UserSummary {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            avatar: user.avatar,
            online: user.online,
            last_seen: user.last_seen,
        }
    }
}

/// Forward-only delivery lifecycle: `Sent` < `Delivered` < `Read`.
///
/// The derived ordering is the state machine: a transition is legal exactly
/// when the target compares greater than the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn can_advance_to(self, target: MessageStatus) -> bool {
        target > self
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Sender's colour preference captured when the message was sent.
    pub color: Option<String>,
}

/// Conversation history row, joined with the sender's display fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    pub sender_avatar: String,
}

/// Admin view of a message, joined with both participants' names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender_name: String,
    pub receiver_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminUserOverview {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub message_color: Option<String>,
    pub messages_sent: i64,
    pub messages_received: i64,
}

/// Privileged user inspection. Carries the stored credential hash, so it must
/// only be produced behind the admin role check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminUserDetail {
    #[serde(flatten)]
    pub overview: AdminUserOverview,
    pub messages: Vec<AdminMessage>,
    pub credential_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Delivered));
        assert!(MessageStatus::Sent.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Delivered.can_advance_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Delivered.can_advance_to(MessageStatus::Delivered));
    }

    #[test]
    fn status_parses_its_own_names() {
        for status in [MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Read] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
        assert!("pending".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&MessageStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
    }
}
