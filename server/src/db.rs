use crate::error::{ChatError, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use time::OffsetDateTime;
use uuid::Uuid;

/// Shared handle to the SQLite store.
///
/// Every query runs on the blocking pool, so callers see each store access as
/// an async I/O boundary.
#[derive(Clone)]
pub struct Db {
    pool: Pool<SqliteConnectionManager>,
}

impl Db {
    /// Open (or create) the database file and run migrations.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|c| {
            c.execute_batch(
                "PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder().max_size(8).build(manager)?;
        let conn = pool.get()?;
        init_db(&conn)?;
        Ok(Self { pool })
    }

    /// Run a closure against a pooled connection off the async runtime.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ChatError::Internal(e.into()))?
    }
}

/// Run migrations on a connection.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Read a TEXT column holding a UUID.
pub fn uuid_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Wall clock in epoch milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  username TEXT UNIQUE NOT NULL,
  display_name TEXT NOT NULL,
  avatar_url TEXT,
  online INTEGER NOT NULL DEFAULT 0,
  last_seen INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chats (
  id TEXT PRIMARY KEY,
  name TEXT,
  is_group INTEGER NOT NULL DEFAULT 0,
  group_admin TEXT REFERENCES users(id),
  last_message_id TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS chats_updated ON chats(updated_at DESC);

CREATE TABLE IF NOT EXISTS chat_participants (
  chat_id TEXT NOT NULL REFERENCES chats(id),
  user_id TEXT NOT NULL REFERENCES users(id),
  position INTEGER NOT NULL,
  PRIMARY KEY (chat_id, user_id)
);
CREATE INDEX IF NOT EXISTS chat_participants_user ON chat_participants(user_id);

CREATE TABLE IF NOT EXISTS chat_deleted_by (
  chat_id TEXT NOT NULL REFERENCES chats(id),
  user_id TEXT NOT NULL REFERENCES users(id),
  PRIMARY KEY (chat_id, user_id)
);

CREATE TABLE IF NOT EXISTS favorites (
  user_id TEXT NOT NULL REFERENCES users(id),
  chat_id TEXT NOT NULL REFERENCES chats(id),
  PRIMARY KEY (user_id, chat_id)
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  chat_id TEXT NOT NULL REFERENCES chats(id),
  sender_id TEXT NOT NULL REFERENCES users(id),
  content TEXT,
  attachment_url TEXT,
  attachment_kind TEXT,
  attachment_name TEXT,
  status TEXT NOT NULL DEFAULT 'sent',
  created_at INTEGER NOT NULL,
  CHECK (content IS NOT NULL OR attachment_url IS NOT NULL)
);
CREATE INDEX IF NOT EXISTS messages_chat_created ON messages(chat_id, created_at DESC);

CREATE TABLE IF NOT EXISTS read_receipts (
  message_id TEXT NOT NULL REFERENCES messages(id),
  user_id TEXT NOT NULL REFERENCES users(id),
  read_at INTEGER NOT NULL,
  PRIMARY KEY (message_id, user_id)
);
"#;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_needs_content_or_attachment() {
        let conn = testing::conn();
        conn.execute(
            "INSERT INTO users (id, username, display_name, created_at) VALUES ('u', 'u', 'U', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO chats (id, created_at, updated_at) VALUES ('c', 0, 0)",
            [],
        )
        .unwrap();
        let res = conn.execute(
            "INSERT INTO messages (id, chat_id, sender_id, created_at) VALUES ('m', 'c', 'u', 0)",
            [],
        );
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn pooled_run_reaches_file_db() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::open(tmp.path().join("chat.db")).unwrap();
        let n: i64 = db
            .run(|c| Ok(c.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
