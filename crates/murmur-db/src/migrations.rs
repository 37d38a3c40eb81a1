use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            username        TEXT NOT NULL UNIQUE,
            password        TEXT NOT NULL,
            avatar          TEXT NOT NULL DEFAULT 'default.png',
            online          INTEGER NOT NULL DEFAULT 0,
            last_seen       TEXT NOT NULL,
            connection_id   TEXT,
            message_color   TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_users_online
            ON users(online, username);

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id       INTEGER NOT NULL REFERENCES users(id),
            receiver_id     INTEGER NOT NULL REFERENCES users(id),
            body            TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'sent'
                            CHECK (status IN ('sent', 'delivered', 'read')),
            color           TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair
            ON messages(sender_id, receiver_id, id);

        CREATE INDEX IF NOT EXISTS idx_messages_receiver
            ON messages(receiver_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
