use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use murmur_db::Database;
use murmur_types::ChatError;
use murmur_types::events::ServerEvent;
use murmur_types::models::{AdminMessage, AdminUserDetail, AdminUserOverview, UserId};

use crate::presence::PresenceRegistry;
use crate::store::run_blocking;

/// Cap on the system-wide message listing.
pub const ALL_MESSAGES_LIMIT: u32 = 1000;

/// Messages included in a single user's detail view.
pub const USER_DETAIL_MESSAGES: u32 = 100;

/// Privileged queries and moderation. Callers are expected to have checked the
/// admin role already; nothing here re-authorizes.
#[derive(Clone)]
pub struct AdminSurface {
    db: Arc<Database>,
    presence: PresenceRegistry,
    transitions: Arc<Mutex<()>>,
}

impl AdminSurface {
    /// `transitions` is the session gateway's login/logout lock; a kick holds
    /// it so a concurrent reconnect cannot slip between the store write and
    /// the registry change.
    pub fn new(db: Arc<Database>, presence: PresenceRegistry, transitions: Arc<Mutex<()>>) -> Self {
        Self {
            db,
            presence,
            transitions,
        }
    }

    pub async fn list_all_users(&self) -> Result<Vec<AdminUserOverview>, ChatError> {
        let rows = run_blocking(&self.db, |db| db.list_users_with_counts()).await?;
        Ok(rows.into_iter().map(|row| row.into_overview()).collect())
    }

    /// Includes the stored credential hash. Every disclosure is written to the
    /// `audit` log target with the requesting admin's id.
    pub async fn get_user_detail(
        &self,
        user_id: UserId,
        requested_by: UserId,
    ) -> Result<AdminUserDetail, ChatError> {
        let (overview, messages, hash) = run_blocking(&self.db, move |db| {
            let Some(overview) = db.get_user_with_counts(user_id)? else {
                return Ok(None);
            };
            let messages = db.get_user_messages(user_id, USER_DETAIL_MESSAGES)?;
            let hash = db.get_password_hash(user_id)?.unwrap_or_default();
            Ok(Some((overview, messages, hash)))
        })
        .await?
        .ok_or_else(|| ChatError::not_found(format!("User {} not found", user_id)))?;

        info!(
            target: "audit",
            admin_id = requested_by,
            user_id,
            "credential hash disclosed through admin user detail"
        );

        Ok(AdminUserDetail {
            overview: overview.into_overview(),
            messages: messages.into_iter().map(|row| row.into_admin_message()).collect(),
            credential_hash: hash,
        })
    }

    pub async fn list_all_messages(&self) -> Result<Vec<AdminMessage>, ChatError> {
        let rows = run_blocking(&self.db, |db| db.get_all_messages(ALL_MESSAGES_LIMIT)).await?;
        Ok(rows.into_iter().map(|row| row.into_admin_message()).collect())
    }

    /// Force a user offline. The store is updated first; only then is the
    /// live connection told, closed and deregistered. Kicking a user who is
    /// already offline succeeds and changes nothing. Returns whether a live
    /// connection was terminated.
    pub async fn kick_user(&self, user_id: UserId) -> Result<bool, ChatError> {
        let _guard = self.transitions.lock().await;
        let existed = run_blocking(&self.db, move |db| {
            if !db.user_exists(user_id)? {
                return Ok(false);
            }
            db.kick_user(user_id)?;
            Ok(true)
        })
        .await?;
        if !existed {
            return Err(ChatError::not_found(format!("User {} not found", user_id)));
        }

        let Some(handle) = self.presence.lookup(user_id).await else {
            return Ok(false);
        };

        handle.push(ServerEvent::ForceDisconnected);
        handle.close();
        self.presence.deregister(user_id, handle.conn_id()).await;
        warn!("User {} kicked, connection {} terminated", user_id, handle.conn_id());
        Ok(true)
    }

    pub async fn set_color_preference(
        &self,
        user_id: UserId,
        color: Option<String>,
    ) -> Result<(), ChatError> {
        let color = color.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
        let updated = run_blocking(&self.db, move |db| db.set_message_color(user_id, color.as_deref())).await?;
        if !updated {
            return Err(ChatError::not_found(format!("User {} not found", user_id)));
        }
        Ok(())
    }
}
