use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageId, MessageStatus, User, UserId, UserSummary};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { user: User },

    /// A user came online or went offline
    PresenceChanged { user_id: UserId, online: bool },

    /// Fresh user listing after someone logged in
    UsersListUpdated { users: Vec<UserSummary> },

    /// A message addressed to this connection's user
    NewMessage { message: Message },

    /// The peer is typing to this connection's user
    UserTyping { from_user_id: UserId },

    /// Acknowledgement to the sender, carrying the final status
    MessageSent { message: Message },

    /// One of the sender's messages moved forward after an explicit read
    MessageStatusChanged {
        message_id: MessageId,
        status: MessageStatus,
    },

    /// An administrator terminated this connection
    ForceDisconnected,

    /// A command from this connection was rejected
    Error { reason: String },
}

impl ServerEvent {
    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            reason: reason.into(),
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    SendMessage { receiver_id: UserId, body: String },

    Typing { receiver_id: UserId },

    MarkRead { message_id: MessageId },

    Logout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_tagged_layout() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"SendMessage","data":{"receiver_id":7,"body":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::SendMessage {
                receiver_id: 7,
                body: "hi".into()
            }
        );

        let logout: ClientCommand = serde_json::from_str(r#"{"type":"Logout"}"#).unwrap();
        assert_eq!(logout, ClientCommand::Logout);
    }

    #[test]
    fn unit_events_serialize_without_data() {
        let json = serde_json::to_value(ServerEvent::ForceDisconnected).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "ForceDisconnected" }));

        let json = serde_json::to_value(ServerEvent::PresenceChanged {
            user_id: 3,
            online: false,
        })
        .unwrap();
        assert_eq!(json["data"]["online"], false);
    }
}
