//! Conversation history storage backed by SQLite.
//!
//! Every operation opens its own connection on a blocking worker thread, so
//! the store is cheap to clone and safe to share across connections.

use crate::conversation::models::{
    Conversation, InsertedConversation, TaskSummary, UserProfile,
};
use anyhow::Context;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::task;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The conversation references a user that does not exist.
    #[error("Invalid user_id. User does not exist.")]
    ForeignKeyViolation,

    #[error("conversation {0} not found")]
    NotFound(i64),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                StoreError::ForeignKeyViolation
            }
            _ => StoreError::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct ConversationStore {
    db_path: PathBuf,
}

impl ConversationStore {
    /// Open (or create) the database at `db_path` and make sure the schema
    /// exists.
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }

        let conn = open_connection(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                first_name TEXT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                due_at INTEGER NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS interests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                conversation_history BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_user_created_at
                ON conversations(user_id, created_at DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_tasks_user_completed
                ON tasks(user_id, completed);
            "#,
        )
        .context("Failed to initialize database schema")?;

        Ok(Self { db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Most recent conversation for `user_id` created within `window` of now.
    pub async fn find_current(
        &self,
        user_id: Uuid,
        window: TimeDelta,
    ) -> StoreResult<Option<Conversation>> {
        self.find_current_at(user_id, window, Utc::now()).await
    }

    pub async fn find_current_at(
        &self,
        user_id: Uuid,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Conversation>> {
        let cutoff = (now - window).timestamp_millis();
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let conversation = conn
                .query_row(
                    r#"
                    SELECT id, user_id, conversation_history, created_at, updated_at
                    FROM conversations
                    WHERE user_id = ?1 AND created_at >= ?2
                    ORDER BY created_at DESC, id DESC
                    LIMIT 1
                    "#,
                    params![user_id.to_string(), cutoff],
                    map_conversation,
                )
                .optional()?;
            Ok(conversation)
        })
        .await
    }

    /// Create a conversation holding `message_log`.
    ///
    /// Fails with [`StoreError::ForeignKeyViolation`] when the user is unknown.
    pub async fn insert(
        &self,
        user_id: Uuid,
        message_log: Vec<u8>,
    ) -> StoreResult<InsertedConversation> {
        self.insert_at(user_id, message_log, Utc::now()).await
    }

    pub async fn insert_at(
        &self,
        user_id: Uuid,
        message_log: Vec<u8>,
        now: DateTime<Utc>,
    ) -> StoreResult<InsertedConversation> {
        let created_at = now.timestamp_millis();
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO conversations (user_id, conversation_history, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                "#,
                params![user_id.to_string(), message_log, created_at],
            )?;
            Ok(InsertedConversation {
                id: conn.last_insert_rowid(),
                created_at: from_millis(created_at),
            })
        })
        .await
    }

    /// Replace the message log of conversation `id` and bump its
    /// modification time. Returns the new `updated_at`.
    pub async fn update(&self, id: i64, message_log: Vec<u8>) -> StoreResult<DateTime<Utc>> {
        let updated_at = Utc::now().timestamp_millis();
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let changed = conn.execute(
                "UPDATE conversations SET conversation_history = ?1, updated_at = ?2 WHERE id = ?3",
                params![message_log, updated_at, id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(from_millis(updated_at))
        })
        .await
    }

    /// Name, open tasks and interests for `user_id`; `None` for an unknown user.
    pub async fn fetch_profile(&self, user_id: Uuid) -> StoreResult<Option<UserProfile>> {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            let user_key = user_id.to_string();

            let first_name: Option<Option<String>> = conn
                .query_row(
                    "SELECT first_name FROM users WHERE id = ?1",
                    params![user_key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(first_name) = first_name else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                r#"
                SELECT id, title, due_at
                FROM tasks
                WHERE user_id = ?1 AND completed = 0
                ORDER BY due_at IS NULL, due_at, id
                "#,
            )?;
            let open_tasks = stmt
                .query_map(params![user_key], |row| {
                    let due_at: Option<i64> = row.get(2)?;
                    Ok(TaskSummary {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        due_at: due_at.map(from_millis),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut stmt =
                conn.prepare("SELECT name FROM interests WHERE user_id = ?1 ORDER BY name")?;
            let interests = stmt
                .query_map(params![user_key], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;

            Ok(Some(UserProfile {
                first_name,
                open_tasks,
                interests,
            }))
        })
        .await
    }

    /// Cheap reachability probe for health reporting.
    pub async fn ping(&self) -> StoreResult<()> {
        self.run_blocking(|db_path| {
            let conn = open_connection(&db_path)?;
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }

    async fn run_blocking<F, T>(&self, task_fn: F) -> StoreResult<T>
    where
        F: FnOnce(PathBuf) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || task_fn(db_path))
            .await
            .map_err(|err| StoreError::Worker(err.to_string()))?
    }
}

#[cfg(test)]
impl ConversationStore {
    pub(crate) async fn seed_user(&self, user_id: Uuid, first_name: Option<&str>) {
        let first_name = first_name.map(str::to_string);
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "INSERT INTO users (id, first_name, created_at) VALUES (?1, ?2, ?3)",
                params![user_id.to_string(), first_name, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    pub(crate) async fn seed_task(&self, user_id: Uuid, title: &str, completed: bool) -> i64 {
        let title = title.to_string();
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "INSERT INTO tasks (user_id, title, completed) VALUES (?1, ?2, ?3)",
                params![user_id.to_string(), title, completed],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .unwrap()
    }

    pub(crate) async fn seed_interest(&self, user_id: Uuid, name: &str) {
        let name = name.to_string();
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            conn.execute(
                "INSERT INTO interests (user_id, name) VALUES (?1, ?2)",
                params![user_id.to_string(), name],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    pub(crate) async fn count_conversations(&self, user_id: Uuid) -> i64 {
        self.run_blocking(move |db_path| {
            let conn = open_connection(&db_path)?;
            Ok(conn.query_row(
                "SELECT COUNT(1) FROM conversations WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }
}

fn map_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let user_id: String = row.get(1)?;
    let user_id = Uuid::parse_str(&user_id)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err)))?;

    Ok(Conversation {
        id: row.get(0)?,
        user_id,
        message_log: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        updated_at: from_millis(row.get(4)?),
    })
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(3))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::models::{Message, MessageLog, Sender};
    use tempfile::TempDir;

    async fn store() -> (TempDir, ConversationStore) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path().join("conversations.sqlite3")).unwrap();
        (dir, store)
    }

    fn log_with(content: &str) -> Vec<u8> {
        let mut log = MessageLog::default();
        log.push(Message::new(Sender::User, content));
        log.to_blob().unwrap()
    }

    /// A conversation created inside the window is found again.
    #[tokio::test]
    async fn test_insert_then_find_current() {
        let (_dir, store) = store().await;
        let user = Uuid::new_v4();
        store.seed_user(user, Some("Mia")).await;

        let inserted = store.insert(user, log_with("hello")).await.unwrap();
        let found = store
            .find_current(user, TimeDelta::minutes(15))
            .await
            .unwrap()
            .expect("conversation within window");

        assert_eq!(found.id, inserted.id);
        assert_eq!(found.user_id, user);
        assert_eq!(found.messages().unwrap().messages[0].content, "hello");
    }

    /// A conversation older than the window is not reused.
    #[tokio::test]
    async fn test_find_current_ignores_stale() {
        let (_dir, store) = store().await;
        let user = Uuid::new_v4();
        store.seed_user(user, None).await;

        let now = Utc::now();
        store
            .insert_at(user, log_with("old"), now - TimeDelta::minutes(20))
            .await
            .unwrap();

        let found = store
            .find_current_at(user, TimeDelta::minutes(15), now)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    /// With several candidates the newest one wins.
    #[tokio::test]
    async fn test_find_current_prefers_newest() {
        let (_dir, store) = store().await;
        let user = Uuid::new_v4();
        store.seed_user(user, None).await;

        let now = Utc::now();
        store
            .insert_at(user, log_with("first"), now - TimeDelta::minutes(10))
            .await
            .unwrap();
        let newer = store
            .insert_at(user, log_with("second"), now - TimeDelta::minutes(2))
            .await
            .unwrap();

        let found = store
            .find_current_at(user, TimeDelta::minutes(15), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);
    }

    /// Conversations of other users never match.
    #[tokio::test]
    async fn test_find_current_scoped_to_user() {
        let (_dir, store) = store().await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.seed_user(alice, None).await;
        store.seed_user(bob, None).await;

        store.insert(alice, log_with("hi")).await.unwrap();
        assert!(store
            .find_current(bob, TimeDelta::minutes(15))
            .await
            .unwrap()
            .is_none());
    }

    /// Inserting for an unknown user surfaces the foreign-key kind.
    #[tokio::test]
    async fn test_insert_unknown_user() {
        let (_dir, store) = store().await;
        let err = store.insert(Uuid::new_v4(), log_with("hi")).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation));
    }

    /// Updating replaces the log and leaves creation time alone.
    #[tokio::test]
    async fn test_update_replaces_log() {
        let (_dir, store) = store().await;
        let user = Uuid::new_v4();
        store.seed_user(user, None).await;

        let created = Utc::now() - TimeDelta::minutes(5);
        let inserted = store.insert_at(user, log_with("one"), created).await.unwrap();
        let updated_at = store.update(inserted.id, log_with("two")).await.unwrap();

        let found = store
            .find_current(user, TimeDelta::minutes(15))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.messages().unwrap().messages[0].content, "two");
        assert_eq!(found.created_at, inserted.created_at);
        assert!(updated_at > found.created_at);
    }

    #[tokio::test]
    async fn test_update_missing_conversation() {
        let (_dir, store) = store().await;
        let err = store.update(999, log_with("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(999)));
    }

    /// Profiles list only open tasks plus interests; unknown users yield None.
    #[tokio::test]
    async fn test_fetch_profile() {
        let (_dir, store) = store().await;
        let user = Uuid::new_v4();
        store.seed_user(user, Some("Mia")).await;
        let open = store.seed_task(user, "Feed the cat", false).await;
        store.seed_task(user, "Brush teeth", true).await;
        store.seed_interest(user, "dinosaurs").await;

        let profile = store.fetch_profile(user).await.unwrap().unwrap();
        assert_eq!(profile.first_name.as_deref(), Some("Mia"));
        assert_eq!(profile.open_tasks.len(), 1);
        assert_eq!(profile.open_tasks[0].id, open);
        assert_eq!(profile.interests, vec!["dinosaurs".to_string()]);

        assert!(store.fetch_profile(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ping() {
        let (_dir, store) = store().await;
        assert!(store.ping().await.is_ok());
    }
}
