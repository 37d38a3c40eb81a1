use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use murmur_types::models::{DEFAULT_AVATAR, MessageStatus};
use rusqlite::{Connection, ErrorCode, Row};

use crate::models::{
    AdminMessageRow, ConversationRow, MessageRow, StatusTransition, UserRow, UserStatsRow,
    WriteOutcome,
};
use crate::{Database, format_ts};

const USER_COLUMNS: &str =
    "id, username, password, avatar, online, last_seen, connection_id, message_color, created_at";

const STATS_COLUMNS: &str = "u.id, u.username, u.avatar, u.online, u.last_seen, u.message_color,
     (SELECT COUNT(*) FROM messages WHERE sender_id = u.id),
     (SELECT COUNT(*) FROM messages WHERE receiver_id = u.id)";

const ADMIN_MESSAGE_SELECT: &str =
    "SELECT m.id, m.sender_id, m.receiver_id, m.body, m.timestamp, m.status, m.color,
            s.username, r.username
     FROM messages m
     JOIN users s ON m.sender_id = s.id
     JOIN users r ON m.receiver_id = r.id";

impl Database {
    // -- Users --

    /// Insert a new account. Returns `None` when the username is taken.
    pub fn create_user(&self, username: &str, password_hash: &str) -> Result<Option<UserRow>> {
        let now = format_ts(Utc::now());
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, password, avatar, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                (username, password_hash, DEFAULT_AVATAR, &now),
            );
            match inserted {
                Ok(_) => query_user_by_id(conn, conn.last_insert_rowid()),
                Err(e) if is_unique_violation(&e) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                [username],
                user_from_row,
            )
            .optional()
        })
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    pub fn user_exists(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |_| Ok(()))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn rename_user(&self, id: i64, new_username: &str) -> Result<WriteOutcome> {
        self.with_conn_mut(|conn| {
            match conn.execute(
                "UPDATE users SET username = ?2 WHERE id = ?1",
                (id, new_username),
            ) {
                Ok(0) => Ok(WriteOutcome::NotFound),
                Ok(_) => Ok(WriteOutcome::Applied),
                Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::Conflict),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn set_avatar(&self, id: i64, avatar: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("UPDATE users SET avatar = ?2 WHERE id = ?1", (id, avatar))?;
            Ok(changed > 0)
        })
    }

    pub fn set_message_color(&self, id: i64, color: Option<&str>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET message_color = ?2 WHERE id = ?1",
                (id, color),
            )?;
            Ok(changed > 0)
        })
    }

    /// Record a fresh connection: online, last_seen stamped, connection id kept.
    pub fn mark_online(&self, id: i64, connection_id: &str, at: DateTime<Utc>) -> Result<Option<UserRow>> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = 1, last_seen = ?2, connection_id = ?3 WHERE id = ?1",
                (id, format_ts(at), connection_id),
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_user_by_id(conn, id)
        })
    }

    /// Flip the user offline, but only while `connection_id` is still the one
    /// on record. A newer login that already overwrote it is left untouched.
    pub fn mark_offline(&self, id: i64, connection_id: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = 0, last_seen = ?2, connection_id = NULL
                 WHERE id = ?1 AND connection_id = ?3",
                (id, format_ts(at), connection_id),
            )?;
            Ok(changed > 0)
        })
    }

    /// Clear the stored online flag and connection reference. Returns whether
    /// anything was actually cleared, so repeated kicks touch nothing.
    pub fn kick_user(&self, id: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = 0, connection_id = NULL
                 WHERE id = ?1 AND (online = 1 OR connection_id IS NOT NULL)",
                [id],
            )?;
            Ok(changed > 0)
        })
    }

    /// Nobody is connected right after start-up.
    pub fn reset_presence(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET online = 0, connection_id = NULL
                 WHERE online = 1 OR connection_id IS NOT NULL",
                [],
            )?;
            Ok(changed)
        })
    }

    /// Force offline every user still flagged online whose last_seen is older
    /// than `cutoff`, skipping ids in `live`. Swept users get last_seen = `at`.
    /// Returns the ids swept.
    pub fn sweep_idle(
        &self,
        cutoff: DateTime<Utc>,
        at: DateTime<Utc>,
        live: &HashSet<i64>,
    ) -> Result<Vec<i64>> {
        let cutoff = format_ts(cutoff);
        let at = format_ts(at);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let candidates: Vec<i64> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM users WHERE online = 1 AND last_seen < ?1")?;
                stmt.query_map([&cutoff], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut swept = Vec::new();
            for id in candidates.into_iter().filter(|id| !live.contains(id)) {
                tx.execute(
                    "UPDATE users SET online = 0, last_seen = ?2, connection_id = NULL WHERE id = ?1",
                    (id, &at),
                )?;
                swept.push(id);
            }
            tx.commit()?;
            Ok(swept)
        })
    }

    /// All users, online first, then by name.
    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY online DESC, username"
            ))?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_users_with_counts(&self) -> Result<Vec<UserStatsRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {STATS_COLUMNS} FROM users u ORDER BY u.username"))?;
            let rows = stmt
                .query_map([], stats_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_user_with_counts(&self, id: i64) -> Result<Option<UserStatsRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {STATS_COLUMNS} FROM users u WHERE u.id = ?1"),
                [id],
                stats_from_row,
            )
            .optional()
        })
    }

    pub fn get_password_hash(&self, id: i64) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT password FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
        })
    }

    // -- Messages --

    /// Persist a message as `sent`. The store assigns id and timestamp.
    pub fn insert_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        body: &str,
        color: Option<&str>,
    ) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let timestamp = format_ts(Utc::now());
            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, body, timestamp, status, color)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    sender_id,
                    receiver_id,
                    body,
                    timestamp,
                    MessageStatus::Sent.as_str(),
                    color
                ],
            )?;
            Ok(MessageRow {
                id: conn.last_insert_rowid(),
                sender_id,
                receiver_id,
                body: body.to_string(),
                timestamp,
                status: MessageStatus::Sent.as_str().to_string(),
                color: color.map(str::to_string),
            })
        })
    }

    pub fn get_message(&self, id: i64) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, sender_id, receiver_id, body, timestamp, status, color
                 FROM messages WHERE id = ?1",
                [id],
                |row| message_from_row(row, 0),
            )
            .optional()
        })
    }

    /// Move a message forward to `target`. Never lowers the status; asking for
    /// a state at or behind the current one leaves the row untouched.
    /// Returns `None` if the message does not exist.
    pub fn advance_message_status(
        &self,
        id: i64,
        target: MessageStatus,
    ) -> Result<Option<StatusTransition>> {
        self.with_conn_mut(|conn| {
            let raw: Option<String> = conn
                .query_row("SELECT status FROM messages WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            let previous: MessageStatus = raw.parse()?;

            if !previous.can_advance_to(target) {
                return Ok(Some(StatusTransition {
                    previous,
                    current: previous,
                }));
            }

            conn.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1",
                (id, target.as_str()),
            )?;
            Ok(Some(StatusTransition {
                previous,
                current: target,
            }))
        })
    }

    /// Both directions of a conversation, in send order.
    pub fn get_conversation(&self, user_a: i64, user_b: i64) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.sender_id, m.receiver_id, m.body, m.timestamp, m.status, m.color,
                        u.username, u.avatar
                 FROM messages m
                 JOIN users u ON m.sender_id = u.id
                 WHERE (m.sender_id = ?1 AND m.receiver_id = ?2)
                    OR (m.sender_id = ?2 AND m.receiver_id = ?1)
                 ORDER BY m.id",
            )?;
            let rows = stmt
                .query_map((user_a, user_b), |row| {
                    Ok(ConversationRow {
                        message: message_from_row(row, 0)?,
                        sender_name: row.get(7)?,
                        sender_avatar: row.get(8)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Newest first, across every conversation.
    pub fn get_all_messages(&self, limit: u32) -> Result<Vec<AdminMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{ADMIN_MESSAGE_SELECT} ORDER BY m.id DESC LIMIT ?1"))?;
            let rows = stmt
                .query_map([limit], admin_message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Newest first, messages the user sent or received.
    pub fn get_user_messages(&self, user_id: i64, limit: u32) -> Result<Vec<AdminMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{ADMIN_MESSAGE_SELECT}
                 WHERE m.sender_id = ?1 OR m.receiver_id = ?1
                 ORDER BY m.id DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], admin_message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user_by_id(conn: &Connection, id: i64) -> Result<Option<UserRow>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        user_from_row,
    )
    .optional()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        avatar: row.get(3)?,
        online: row.get(4)?,
        last_seen: row.get(5)?,
        connection_id: row.get(6)?,
        message_color: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn stats_from_row(row: &Row<'_>) -> rusqlite::Result<UserStatsRow> {
    Ok(UserStatsRow {
        id: row.get(0)?,
        username: row.get(1)?,
        avatar: row.get(2)?,
        online: row.get(3)?,
        last_seen: row.get(4)?,
        message_color: row.get(5)?,
        messages_sent: row.get(6)?,
        messages_received: row.get(7)?,
    })
}

fn message_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(offset)?,
        sender_id: row.get(offset + 1)?,
        receiver_id: row.get(offset + 2)?,
        body: row.get(offset + 3)?,
        timestamp: row.get(offset + 4)?,
        status: row.get(offset + 5)?,
        color: row.get(offset + 6)?,
    })
}

fn admin_message_from_row(row: &Row<'_>) -> rusqlite::Result<AdminMessageRow> {
    Ok(AdminMessageRow {
        message: message_from_row(row, 0)?,
        sender_name: row.get(7)?,
        receiver_name: row.get(8)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_pair() -> (Database, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "hash-a").unwrap().unwrap().id;
        let bob = db.create_user("bob", "hash-b").unwrap().unwrap().id;
        (db, alice, bob)
    }

    #[test]
    fn duplicate_username_is_reported_not_raised() {
        let (db, _, _) = db_with_pair();
        assert!(db.create_user("alice", "other").unwrap().is_none());
    }

    #[test]
    fn new_users_start_offline_with_default_avatar() {
        let (db, alice, _) = db_with_pair();
        let row = db.get_user_by_id(alice).unwrap().unwrap();
        assert!(!row.online);
        assert_eq!(row.avatar, DEFAULT_AVATAR);
        assert!(row.connection_id.is_none());
    }

    #[test]
    fn message_ids_strictly_increase() {
        let (db, alice, bob) = db_with_pair();
        let mut last = 0;
        for i in 0..20 {
            let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
            let row = db.insert_message(from, to, "ping", None).unwrap();
            assert!(row.id > last);
            assert_eq!(row.status, "sent");
            last = row.id;
        }
    }

    #[test]
    fn status_never_moves_backwards() {
        let (db, alice, bob) = db_with_pair();
        let id = db.insert_message(alice, bob, "hello", None).unwrap().id;

        let t = db.advance_message_status(id, MessageStatus::Read).unwrap().unwrap();
        assert_eq!(t.previous, MessageStatus::Sent);
        assert_eq!(t.current, MessageStatus::Read);
        assert!(t.changed());

        let t = db
            .advance_message_status(id, MessageStatus::Delivered)
            .unwrap()
            .unwrap();
        assert_eq!(t.current, MessageStatus::Read);
        assert!(!t.changed());

        let t = db.advance_message_status(id, MessageStatus::Read).unwrap().unwrap();
        assert!(!t.changed());

        assert!(db.advance_message_status(9999, MessageStatus::Read).unwrap().is_none());
    }

    #[test]
    fn conversation_returns_both_directions_in_send_order() {
        let (db, alice, bob) = db_with_pair();
        let carol = db.create_user("carol", "hash-c").unwrap().unwrap().id;
        db.insert_message(alice, bob, "one", Some("#ff0000")).unwrap();
        db.insert_message(bob, alice, "two", None).unwrap();
        db.insert_message(alice, carol, "elsewhere", None).unwrap();
        db.insert_message(alice, bob, "three", None).unwrap();

        let rows = db.get_conversation(bob, alice).unwrap();
        let bodies: Vec<_> = rows.iter().map(|r| r.message.body.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
        assert_eq!(rows[0].sender_name, "alice");
        assert_eq!(rows[0].message.color.as_deref(), Some("#ff0000"));
        assert_eq!(rows[1].sender_name, "bob");
    }

    #[test]
    fn listing_puts_online_users_first() {
        let (db, _, bob) = db_with_pair();
        db.create_user("aaron", "hash").unwrap();
        db.mark_online(bob, "conn-1", Utc::now()).unwrap();

        let names: Vec<_> = db.list_users().unwrap().into_iter().map(|u| u.username).collect();
        assert_eq!(names, ["bob", "aaron", "alice"]);
    }

    #[test]
    fn rename_detects_conflicts_and_missing_users() {
        let (db, alice, _) = db_with_pair();
        assert_eq!(db.rename_user(alice, "bob").unwrap(), WriteOutcome::Conflict);
        assert_eq!(db.rename_user(4242, "nobody").unwrap(), WriteOutcome::NotFound);
        assert_eq!(db.rename_user(alice, "alicia").unwrap(), WriteOutcome::Applied);
        assert!(db.get_user_by_username("alicia").unwrap().is_some());
    }

    #[test]
    fn kick_clears_state_once() {
        let (db, alice, _) = db_with_pair();
        db.mark_online(alice, "conn-1", Utc::now()).unwrap();

        assert!(db.kick_user(alice).unwrap());
        let row = db.get_user_by_id(alice).unwrap().unwrap();
        assert!(!row.online);
        assert!(row.connection_id.is_none());

        assert!(!db.kick_user(alice).unwrap());
    }

    #[test]
    fn stale_connection_cannot_mark_newer_login_offline() {
        let (db, alice, _) = db_with_pair();
        db.mark_online(alice, "old-conn", Utc::now()).unwrap();
        db.mark_online(alice, "new-conn", Utc::now()).unwrap();

        assert!(!db.mark_offline(alice, "old-conn", Utc::now()).unwrap());
        let row = db.get_user_by_id(alice).unwrap().unwrap();
        assert!(row.online);
        assert_eq!(row.connection_id.as_deref(), Some("new-conn"));

        assert!(db.mark_offline(alice, "new-conn", Utc::now()).unwrap());
        let row = db.get_user_by_id(alice).unwrap().unwrap();
        assert!(!row.online);
        assert!(row.connection_id.is_none());
    }

    #[test]
    fn idle_sweep_skips_live_and_recent_users() {
        let (db, alice, bob) = db_with_pair();
        let carol = db.create_user("carol", "hash-c").unwrap().unwrap().id;
        let long_ago = Utc::now() - chrono::Duration::minutes(30);
        db.mark_online(alice, "a", long_ago).unwrap();
        db.mark_online(bob, "b", long_ago).unwrap();
        db.mark_online(carol, "c", Utc::now()).unwrap();

        let live: HashSet<i64> = [bob].into_iter().collect();
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        let swept_at = Utc::now();
        let swept = db.sweep_idle(cutoff, swept_at, &live).unwrap();

        assert_eq!(swept, vec![alice]);
        let row = db.get_user_by_id(alice).unwrap().unwrap();
        assert!(!row.online);
        assert!(row.connection_id.is_none());
        assert_eq!(row.last_seen, format_ts(swept_at));
        assert_eq!(db.get_user_by_id(bob).unwrap().unwrap().last_seen, format_ts(long_ago));
        assert!(db.get_user_by_id(bob).unwrap().unwrap().online);
        assert!(db.get_user_by_id(carol).unwrap().unwrap().online);
    }

    #[test]
    fn admin_queries_count_and_cap() {
        let (db, alice, bob) = db_with_pair();
        for _ in 0..3 {
            db.insert_message(alice, bob, "a->b", None).unwrap();
        }
        db.insert_message(bob, alice, "b->a", None).unwrap();

        let stats = db.get_user_with_counts(alice).unwrap().unwrap();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_received, 1);

        let all = db.get_all_messages(2).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].message.body, "b->a");
        assert_eq!(all[0].sender_name, "bob");
        assert_eq!(all[0].receiver_name, "alice");

        let mine = db.get_user_messages(bob, 100).unwrap();
        assert_eq!(mine.len(), 4);
        assert_eq!(db.get_password_hash(alice).unwrap().as_deref(), Some("hash-a"));
    }
}
