use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, trace, warn};
use uuid::Uuid;

use murmur_db::Database;
use murmur_types::ChatError;
use murmur_types::events::ServerEvent;
use murmur_types::models::{Message, MessageId, User, UserId};

use crate::admin::AdminSurface;
use crate::config::GatewayConfig;
use crate::delivery::DeliveryEngine;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::store::run_blocking;

/// Reactions to the real-time events of one logged-in user. Transport-free:
/// `connection` feeds it from a WebSocket, tests feed it directly.
#[derive(Clone)]
pub struct SessionGateway {
    db: Arc<Database>,
    presence: PresenceRegistry,
    engine: DeliveryEngine,
    config: GatewayConfig,
    /// Held across the store write and the registry change of every login and
    /// logout, so the stored online flag and the registry move together.
    transitions: Arc<Mutex<()>>,
}

impl SessionGateway {
    pub fn new(db: Arc<Database>, config: GatewayConfig) -> Self {
        let presence = PresenceRegistry::new();
        let engine = DeliveryEngine::new(db.clone(), presence.clone(), config.read_receipts);
        Self {
            db,
            presence,
            engine,
            config,
            transitions: Arc::new(Mutex::new(())),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn admin(&self) -> AdminSurface {
        AdminSurface::new(self.db.clone(), self.presence.clone(), self.transitions.clone())
    }

    /// Persist the user as online, bind the connection, then tell everyone.
    /// Nothing is broadcast if the store write fails.
    pub async fn login(&self, user_id: UserId, handle: ConnectionHandle) -> Result<User, ChatError> {
        let conn_id = handle.conn_id().to_string();
        let now = Utc::now();

        let user = {
            let _guard = self.transitions.lock().await;
            let user = run_blocking(&self.db, move |db| db.mark_online(user_id, &conn_id, now))
                .await?
                .ok_or_else(|| ChatError::not_found(format!("User {} not found", user_id)))?
                .into_user();

            if let Some(previous) = self.presence.register(user_id, handle).await {
                info!(
                    "{} ({}) reconnected, connection {} superseded",
                    user.username,
                    user_id,
                    previous.conn_id()
                );
            }
            user
        };

        if let Err(e) = self.broadcast_users_list().await {
            warn!("Could not refresh user list after login of {}: {}", user_id, e);
        }

        info!("{} ({}) logged in", user.username, user_id);
        Ok(user)
    }

    pub async fn send_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        body: &str,
    ) -> Result<Message, ChatError> {
        if sender_id == receiver_id {
            return Err(ChatError::validation("You cannot send a message to yourself"));
        }
        if body.trim().is_empty() {
            return Err(ChatError::validation("Message body cannot be empty"));
        }

        let color = run_blocking(&self.db, move |db| db.get_user_by_id(sender_id))
            .await?
            .ok_or_else(|| ChatError::not_found(format!("User {} not found", sender_id)))?
            .message_color;

        self.engine.send(sender_id, receiver_id, body, color).await
    }

    /// Ephemeral; dropped when the receiver is not connected.
    pub async fn typing(&self, sender_id: UserId, receiver_id: UserId) -> bool {
        let forwarded = self
            .presence
            .send_to_user(
                receiver_id,
                ServerEvent::UserTyping {
                    from_user_id: sender_id,
                },
            )
            .await;
        if !forwarded {
            trace!("Typing from {} to offline {} dropped", sender_id, receiver_id);
        }
        forwarded
    }

    pub async fn mark_read(&self, reader_id: UserId, message_id: MessageId) -> Result<Message, ChatError> {
        self.engine.mark_read(message_id, reader_id).await
    }

    /// Explicit logout or connection drop. Only the connection that currently
    /// owns the presence entry flips the user offline; any later or stale call
    /// returns `Ok(false)` and touches nothing.
    pub async fn logout(&self, user_id: UserId, conn_id: Uuid) -> Result<bool, ChatError> {
        let _guard = self.transitions.lock().await;
        if !self.presence.deregister(user_id, conn_id).await {
            return Ok(false);
        }

        let now = Utc::now();
        let conn_id = conn_id.to_string();
        run_blocking(&self.db, move |db| db.mark_offline(user_id, &conn_id, now)).await?;
        info!("User {} logged out", user_id);
        Ok(true)
    }

    pub async fn broadcast_users_list(&self) -> Result<(), ChatError> {
        let users = run_blocking(&self.db, |db| db.list_users()).await?;
        self.presence.broadcast(ServerEvent::UsersListUpdated {
            users: users.into_iter().map(|row| row.into_summary()).collect(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Outbound;
    use murmur_types::models::MessageStatus;
    use tokio::sync::{broadcast, mpsc};

    fn gateway() -> SessionGateway {
        SessionGateway::new(Arc::new(Database::open_in_memory().unwrap()), GatewayConfig::default())
    }

    fn register(gw: &SessionGateway, name: &str) -> UserId {
        gw.db().create_user(name, "hash").unwrap().unwrap().id
    }

    fn events(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(Outbound::Event(event)) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn broadcasts(rx: &mut broadcast::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn login_persists_online_and_broadcasts_presence_then_list() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let mut bus = gw.presence().subscribe();

        let (handle, _rx) = ConnectionHandle::new();
        let conn_id = handle.conn_id().to_string();
        let user = gw.login(alice, handle).await.unwrap();
        assert!(user.online);

        let row = gw.db().get_user_by_id(alice).unwrap().unwrap();
        assert!(row.online);
        assert_eq!(row.connection_id, Some(conn_id));

        let seen = broadcasts(&mut bus);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ServerEvent::PresenceChanged { user_id: alice, online: true });
        let ServerEvent::UsersListUpdated { users } = &seen[1] else {
            panic!("expected a user list");
        };
        assert!(users.iter().any(|u| u.id == alice && u.online));
    }

    #[tokio::test]
    async fn login_of_unknown_user_fires_nothing() {
        let gw = gateway();
        let mut bus = gw.presence().subscribe();
        let (handle, _rx) = ConnectionHandle::new();

        let err = gw.login(404, handle).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(broadcasts(&mut bus).is_empty());
        assert!(gw.presence().lookup(404).await.is_none());
    }

    #[tokio::test]
    async fn duplicate_close_is_a_noop() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let (handle, _rx) = ConnectionHandle::new();
        let conn_id = handle.conn_id();
        gw.login(alice, handle).await.unwrap();

        assert!(gw.logout(alice, conn_id).await.unwrap());
        assert!(!gw.logout(alice, conn_id).await.unwrap());
        assert!(!gw.db().get_user_by_id(alice).unwrap().unwrap().online);
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_session_online() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let (old, _old_rx) = ConnectionHandle::new();
        let old_id = old.conn_id();
        let (new, _new_rx) = ConnectionHandle::new();
        gw.login(alice, old).await.unwrap();
        gw.login(alice, new).await.unwrap();

        assert!(!gw.logout(alice, old_id).await.unwrap());
        assert!(gw.presence().is_online(alice).await);
        assert!(gw.db().get_user_by_id(alice).unwrap().unwrap().online);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconnect_racing_old_close_keeps_store_and_registry_in_step() {
        let gw = gateway();
        let alice = register(&gw, "alice");

        for _ in 0..200 {
            let (old, _old_rx) = ConnectionHandle::new();
            let old_id = old.conn_id();
            gw.login(alice, old).await.unwrap();

            let (new, _new_rx) = ConnectionHandle::new();
            let new_id = new.conn_id();
            let login = tokio::spawn({
                let gw = gw.clone();
                async move { gw.login(alice, new).await }
            });
            let logout = tokio::spawn({
                let gw = gw.clone();
                async move { gw.logout(alice, old_id).await }
            });
            login.await.unwrap().unwrap();
            logout.await.unwrap().unwrap();

            let live = gw.presence().lookup(alice).await.map(|h| h.conn_id());
            let row = gw.db().get_user_by_id(alice).unwrap().unwrap();
            match live {
                Some(id) => {
                    assert_eq!(id, new_id);
                    assert!(row.online, "registry is live but the store says offline");
                    assert_eq!(row.connection_id, Some(new_id.to_string()));
                }
                None => assert!(!row.online, "store says online with no live connection"),
            }

            gw.logout(alice, new_id).await.unwrap();
            assert!(!gw.db().get_user_by_id(alice).unwrap().unwrap().online);
        }
    }

    #[tokio::test]
    async fn self_messages_are_rejected_at_the_boundary() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let err = gw.send_message(alice, alice, "me").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn typing_is_forwarded_only_to_present_users() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let bob = register(&gw, "bob");
        assert!(!gw.typing(alice, bob).await);

        let (handle, mut bob_rx) = ConnectionHandle::new();
        gw.login(bob, handle).await.unwrap();
        assert!(gw.typing(alice, bob).await);
        assert_eq!(events(&mut bob_rx), vec![ServerEvent::UserTyping { from_user_id: alice }]);
    }

    #[tokio::test]
    async fn color_preference_is_snapshotted_at_send_time() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let bob = register(&gw, "bob");
        gw.db().set_message_color(alice, Some("#123456")).unwrap();

        let first = gw.send_message(alice, bob, "colored").await.unwrap();
        gw.db().set_message_color(alice, None).unwrap();
        let second = gw.send_message(alice, bob, "plain").await.unwrap();

        let history = gw.db().get_conversation(alice, bob).unwrap();
        assert_eq!(first.color.as_deref(), Some("#123456"));
        assert_eq!(history[0].message.color.as_deref(), Some("#123456"));
        assert_eq!(second.color, None);
    }

    #[tokio::test]
    async fn alice_and_bob_end_to_end() {
        let gw = gateway();
        let alice = register(&gw, "alice");
        let bob = register(&gw, "bob");

        let (alice_handle, mut alice_rx) = ConnectionHandle::new();
        gw.login(alice, alice_handle).await.unwrap();
        let (bob_handle, mut bob_rx) = ConnectionHandle::new();
        let bob_conn = bob_handle.conn_id();
        gw.login(bob, bob_handle).await.unwrap();

        let hi = gw.send_message(alice, bob, "hi").await.unwrap();
        let bob_saw = events(&mut bob_rx);
        assert_eq!(bob_saw.len(), 1);
        let ServerEvent::NewMessage { message } = &bob_saw[0] else {
            panic!("bob expected a new message");
        };
        assert_eq!(message.body, "hi");
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(
            events(&mut alice_rx),
            vec![ServerEvent::MessageSent { message: hi.clone() }]
        );
        assert_eq!(hi.status, MessageStatus::Read);

        gw.logout(bob, bob_conn).await.unwrap();
        let later = gw.send_message(alice, bob, "still there?").await.unwrap();
        assert_eq!(later.status, MessageStatus::Sent);
        assert!(events(&mut bob_rx).is_empty());

        let (bob_again, _rx) = ConnectionHandle::new();
        gw.login(bob, bob_again).await.unwrap();
        let history = gw.db().get_conversation(alice, bob).unwrap();
        let bodies: Vec<_> = history.iter().map(|r| r.message.body.as_str()).collect();
        assert_eq!(bodies, ["hi", "still there?"]);
        assert_eq!(history[1].message.status, "sent");
    }
}
