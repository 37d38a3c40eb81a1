use std::sync::Arc;

use tracing::debug;

use murmur_db::Database;
use murmur_types::ChatError;
use murmur_types::events::ServerEvent;
use murmur_types::models::{Message, MessageId, MessageStatus, UserId};

use crate::config::ReadReceiptPolicy;
use crate::presence::PresenceRegistry;
use crate::store::run_blocking;

/// Persists messages, decides deliverability from presence, walks the status
/// forward and notifies both ends.
#[derive(Clone)]
pub struct DeliveryEngine {
    db: Arc<Database>,
    presence: PresenceRegistry,
    policy: ReadReceiptPolicy,
}

impl DeliveryEngine {
    pub fn new(db: Arc<Database>, presence: PresenceRegistry, policy: ReadReceiptPolicy) -> Self {
        Self {
            db,
            presence,
            policy,
        }
    }

    /// Store one message and push it out.
    ///
    /// Every write happens before the first push, so a storage failure leaves
    /// no notification behind. The receiver sees the message as `delivered`;
    /// the sender's `MessageSent` ack carries the final stored status.
    pub async fn send(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        body: &str,
        color: Option<String>,
    ) -> Result<Message, ChatError> {
        if body.trim().is_empty() {
            return Err(ChatError::validation("Message body cannot be empty"));
        }

        if !self.presence.is_online(receiver_id).await
            && !run_blocking(&self.db, move |db| db.user_exists(receiver_id)).await?
        {
            return Err(ChatError::InvalidRecipient(receiver_id));
        }

        let body = body.to_string();
        let row = run_blocking(&self.db, move |db| {
            db.insert_message(sender_id, receiver_id, &body, color.as_deref())
        })
        .await?;
        let mut message = row.into_message();

        match self.presence.lookup(receiver_id).await {
            Some(receiver) => {
                let id = message.id;
                let policy = self.policy;
                let status = run_blocking(&self.db, move |db| {
                    let mut status = MessageStatus::Sent;
                    if let Some(t) = db.advance_message_status(id, MessageStatus::Delivered)? {
                        status = t.current;
                    }
                    if policy == ReadReceiptPolicy::OnDelivery {
                        if let Some(t) = db.advance_message_status(id, MessageStatus::Read)? {
                            status = t.current;
                        }
                    }
                    Ok(status)
                })
                .await?;

                let delivered = Message {
                    status: MessageStatus::Delivered,
                    ..message.clone()
                };
                message.status = status;

                if !receiver.push(ServerEvent::NewMessage { message: delivered }) {
                    debug!(
                        "Receiver {} dropped before message {} could be pushed",
                        receiver_id, message.id
                    );
                }
            }
            None => {
                debug!("Receiver {} offline, message {} left as sent", receiver_id, message.id);
            }
        }

        debug!(
            "Message {} from {} to {} stored as {}",
            message.id, sender_id, receiver_id, message.status
        );

        self.presence
            .send_to_user(
                sender_id,
                ServerEvent::MessageSent {
                    message: message.clone(),
                },
            )
            .await;

        Ok(message)
    }

    /// Explicit read receipt from the receiver. Idempotent: a message already
    /// `read` stays `read` and nobody is notified again.
    pub async fn mark_read(&self, message_id: MessageId, reader_id: UserId) -> Result<Message, ChatError> {
        let row = run_blocking(&self.db, move |db| db.get_message(message_id))
            .await?
            .ok_or_else(|| ChatError::not_found(format!("Message {} not found", message_id)))?;

        if row.receiver_id != reader_id {
            return Err(ChatError::auth("Only the recipient can mark a message as read"));
        }

        let transition = run_blocking(&self.db, move |db| {
            db.advance_message_status(message_id, MessageStatus::Read)
        })
        .await?
        .ok_or_else(|| ChatError::not_found(format!("Message {} not found", message_id)))?;

        let mut message = row.into_message();
        message.status = transition.current;

        if transition.changed() {
            self.presence
                .send_to_user(
                    message.sender_id,
                    ServerEvent::MessageStatusChanged {
                        message_id,
                        status: message.status,
                    },
                )
                .await;
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{ConnectionHandle, Outbound};
    use tokio::sync::mpsc;

    struct Fixture {
        db: Arc<Database>,
        presence: PresenceRegistry,
        alice: UserId,
        bob: UserId,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = db.create_user("alice", "h").unwrap().unwrap().id;
        let bob = db.create_user("bob", "h").unwrap().unwrap().id;
        Fixture {
            db,
            presence: PresenceRegistry::new(),
            alice,
            bob,
        }
    }

    async fn connect(presence: &PresenceRegistry, user: UserId) -> mpsc::UnboundedReceiver<Outbound> {
        let (handle, rx) = ConnectionHandle::new();
        presence.register(user, handle).await;
        rx
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Option<ServerEvent> {
        match rx.try_recv() {
            Ok(Outbound::Event(event)) => Some(event),
            _ => None,
        }
    }

    #[tokio::test]
    async fn online_receiver_gets_one_push_and_sender_an_ack() {
        let f = fixture();
        let engine = DeliveryEngine::new(f.db.clone(), f.presence.clone(), ReadReceiptPolicy::OnDelivery);
        let mut alice_rx = connect(&f.presence, f.alice).await;
        let mut bob_rx = connect(&f.presence, f.bob).await;

        let sent = engine.send(f.alice, f.bob, "hi", Some("#00ff00".into())).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Read);
        assert_eq!(sent.color.as_deref(), Some("#00ff00"));

        let Some(ServerEvent::NewMessage { message }) = next_event(&mut bob_rx) else {
            panic!("bob should receive the message");
        };
        assert_eq!(message.id, sent.id);
        assert_eq!(message.body, "hi");
        assert_eq!(message.timestamp, sent.timestamp);
        assert_eq!(message.status, MessageStatus::Delivered);
        assert!(next_event(&mut bob_rx).is_none());

        let Some(ServerEvent::MessageSent { message: ack }) = next_event(&mut alice_rx) else {
            panic!("alice should receive an ack");
        };
        assert_eq!(ack, sent);

        let stored = f.db.get_message(sent.id).unwrap().unwrap();
        assert_eq!(stored.status, "read");
    }

    #[tokio::test]
    async fn explicit_policy_stops_at_delivered() {
        let f = fixture();
        let engine = DeliveryEngine::new(f.db.clone(), f.presence.clone(), ReadReceiptPolicy::Explicit);
        let mut alice_rx = connect(&f.presence, f.alice).await;
        let _bob_rx = connect(&f.presence, f.bob).await;

        let sent = engine.send(f.alice, f.bob, "hello", None).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Delivered);
        next_event(&mut alice_rx);

        let read = engine.mark_read(sent.id, f.bob).await.unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        assert_eq!(
            next_event(&mut alice_rx),
            Some(ServerEvent::MessageStatusChanged {
                message_id: sent.id,
                status: MessageStatus::Read
            })
        );

        // Second receipt is a silent no-op
        let again = engine.mark_read(sent.id, f.bob).await.unwrap();
        assert_eq!(again.status, MessageStatus::Read);
        assert!(next_event(&mut alice_rx).is_none());
    }

    #[tokio::test]
    async fn offline_receiver_leaves_message_sent() {
        let f = fixture();
        let engine = DeliveryEngine::new(f.db.clone(), f.presence.clone(), ReadReceiptPolicy::OnDelivery);
        let mut alice_rx = connect(&f.presence, f.alice).await;

        let sent = engine.send(f.alice, f.bob, "anyone?", None).await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);

        let Some(ServerEvent::MessageSent { message }) = next_event(&mut alice_rx) else {
            panic!("ack expected");
        };
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(f.db.get_message(sent.id).unwrap().unwrap().status, "sent");
    }

    #[tokio::test]
    async fn rejects_blank_body_and_unknown_recipient_without_persisting() {
        let f = fixture();
        let engine = DeliveryEngine::new(f.db.clone(), f.presence.clone(), ReadReceiptPolicy::OnDelivery);

        let err = engine.send(f.alice, f.bob, "   \n", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = engine.send(f.alice, 999, "hi", None).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidRecipient(999)));

        assert!(f.db.get_all_messages(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_the_receiver_may_mark_read() {
        let f = fixture();
        let engine = DeliveryEngine::new(f.db.clone(), f.presence.clone(), ReadReceiptPolicy::Explicit);
        let sent = engine.send(f.alice, f.bob, "secret", None).await.unwrap();

        let err = engine.mark_read(sent.id, f.alice).await.unwrap_err();
        assert!(matches!(err, ChatError::Auth(_)));

        let err = engine.mark_read(sent.id + 100, f.bob).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        // Offline delivery never happened, but an explicit read still moves forward
        let read = engine.mark_read(sent.id, f.bob).await.unwrap();
        assert_eq!(read.status, MessageStatus::Read);
    }
}
