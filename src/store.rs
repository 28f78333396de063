//! The relational store seam and its SQLite implementation.

use crate::config::SQLITE_BUSY_TIMEOUT_MS;
use crate::error::StoreError;
use crate::models::{Comment, Post, Record};
use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{ffi, params_from_iter, Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// What a rollback discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// Only the record staged or flushed by the last `add`/`flush`.
    Statement,
    /// Everything since the last commit.
    Transaction,
}

/// Minimal transactional store used by the batch ingestor.
///
/// `begin` opens the batch transaction, `add` stages a record, `flush` writes it
/// inside the open transaction so that constraint violations surface early, and
/// `commit` makes all flushed records durable at once.
pub trait Store {
    /// Stores that open transactions lazily can keep the default.
    fn begin(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
    fn add<R: Record>(&mut self, record: &R) -> Result<(), StoreError>;
    fn flush(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self, scope: Rollback) -> Result<(), StoreError>;
}

struct Staged {
    sql: String,
    id: String,
    values: Vec<SqlValue>,
}

const SAVEPOINT: &str = "record";

pub struct SqliteStore {
    conn: Connection,
    staged: Option<Staged>,
    // A flush failed and its savepoint is still open.
    statement_open: bool,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS))
            .context("Failed to set busy timeout")?;
        debug!(path = %path.display(), "Opened SQLite store");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            staged: None,
            statement_open: false,
        }
    }

    /// Creates the post and comment tables if they do not exist yet.
    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS post (
                    id TEXT PRIMARY KEY NOT NULL,
                    subreddit TEXT NOT NULL,
                    title TEXT NOT NULL,
                    selftext TEXT,
                    author TEXT NOT NULL,
                    created_utc INTEGER NOT NULL,
                    num_comments INTEGER NOT NULL,
                    score INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    archived BOOLEAN NOT NULL DEFAULT 0,
                    domain TEXT,
                    over_18 BOOLEAN NOT NULL DEFAULT 0,
                    permalink TEXT NOT NULL,
                    is_video BOOLEAN NOT NULL DEFAULT 0
                );

                -- no foreign key on post_id: comment archives may load before their posts
                CREATE TABLE IF NOT EXISTS comment (
                    id TEXT PRIMARY KEY NOT NULL,
                    subreddit TEXT NOT NULL DEFAULT '',
                    author TEXT,
                    body TEXT,
                    created_utc INTEGER,
                    link_id TEXT,
                    controversiality INTEGER,
                    ups INTEGER,
                    score INTEGER,
                    gilded INTEGER,
                    retrieved_on INTEGER,
                    distinguished TEXT,
                    post_id TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_post_subreddit_created
                    ON post (subreddit, created_utc);
                CREATE INDEX IF NOT EXISTS idx_comment_subreddit_created
                    ON comment (subreddit, created_utc);
                CREATE INDEX IF NOT EXISTS idx_comment_post_id ON comment (post_id);
                "#,
            )
            .context("Failed to create schema")?;
        info!("Schema ready");
        Ok(())
    }

    pub fn count(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", checked_table(table)?);
        let count: i64 = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("Failed to count rows in {table}"))?;
        Ok(count as u64)
    }

    /// All ids of a table in insertion order.
    pub fn ids(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("SELECT id FROM {} ORDER BY rowid", checked_table(table)?);
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to read ids from {table}"))?;
        Ok(ids)
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    // IMMEDIATE takes the write lock up front, so concurrent writers queue on
    // the busy timeout instead of failing a lock upgrade mid-batch.
    fn begin_if_needed(&self) -> Result<(), StoreError> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }
}

fn checked_table(table: &str) -> Result<&str> {
    match table {
        t if t == Post::TABLE || t == Comment::TABLE => Ok(t),
        other => anyhow::bail!("Unknown table: {other}"),
    }
}

fn insert_sql<R: Record>() -> String {
    let placeholders = (1..=R::COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        R::TABLE,
        R::COLUMNS.join(", "),
        placeholders
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
        }
        _ => false,
    }
}

impl Store for SqliteStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        self.begin_if_needed()
    }

    fn add<R: Record>(&mut self, record: &R) -> Result<(), StoreError> {
        self.staged = Some(Staged {
            sql: insert_sql::<R>(),
            id: record.id().to_string(),
            values: record.values(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let staged = self.staged.take().ok_or(StoreError::NothingStaged)?;
        self.begin_if_needed()?;
        self.conn.execute_batch(&format!("SAVEPOINT {SAVEPOINT}"))?;
        self.statement_open = true;

        let result = self
            .conn
            .prepare_cached(&staged.sql)
            .and_then(|mut stmt| stmt.execute(params_from_iter(staged.values.iter())));

        match result {
            Ok(_) => {
                self.conn.execute_batch(&format!("RELEASE {SAVEPOINT}"))?;
                self.statement_open = false;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(StoreError::UniqueViolation { id: staged.id }),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.statement_open {
            self.rollback(Rollback::Statement)?;
        }
        self.staged = None;
        if self.in_transaction() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    fn rollback(&mut self, scope: Rollback) -> Result<(), StoreError> {
        self.staged = None;
        match scope {
            Rollback::Statement => {
                if self.statement_open {
                    self.conn.execute_batch(&format!(
                        "ROLLBACK TO {SAVEPOINT}; RELEASE {SAVEPOINT}"
                    ))?;
                    self.statement_open = false;
                }
            }
            Rollback::Transaction => {
                self.statement_open = false;
                if self.in_transaction() {
                    self.conn.execute_batch("ROLLBACK")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    fn comment(id: &str) -> Comment {
        Comment::from_raw(json!({"id": id, "link_id": "t3_p1"}).as_object().unwrap().clone())
            .unwrap()
    }

    #[test]
    fn insert_sql_lists_all_columns() {
        let sql = insert_sql::<Comment>();
        assert!(sql.starts_with("INSERT INTO comment (id, subreddit,"));
        assert!(sql.ends_with("?12, ?13)"));
    }

    #[test]
    fn flush_then_commit_persists() {
        let mut store = store();
        store.add(&comment("c1")).unwrap();
        store.flush().unwrap();
        assert!(store.in_transaction());
        store.commit().unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.ids("comment").unwrap(), vec!["c1"]);
    }

    #[test]
    fn flush_without_add_fails() {
        let mut store = store();
        assert!(matches!(store.flush(), Err(StoreError::NothingStaged)));
    }

    #[test]
    fn duplicate_id_is_a_unique_violation() {
        let mut store = store();
        store.add(&comment("c1")).unwrap();
        store.flush().unwrap();
        store.add(&comment("c1")).unwrap();
        let err = store.flush().unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { ref id } if id == "c1"));
    }

    #[test]
    fn statement_rollback_keeps_earlier_records() {
        let mut store = store();
        store.add(&comment("c1")).unwrap();
        store.flush().unwrap();
        store.add(&comment("c1")).unwrap();
        assert!(store.flush().is_err());
        store.rollback(Rollback::Statement).unwrap();

        store.add(&comment("c2")).unwrap();
        store.flush().unwrap();
        store.commit().unwrap();
        assert_eq!(store.ids("comment").unwrap(), vec!["c1", "c2"]);
    }

    #[test]
    fn transaction_rollback_discards_flushed_records() {
        let mut store = store();
        store.add(&comment("c1")).unwrap();
        store.flush().unwrap();
        store.commit().unwrap();

        store.add(&comment("c2")).unwrap();
        store.flush().unwrap();
        store.rollback(Rollback::Transaction).unwrap();
        assert_eq!(store.ids("comment").unwrap(), vec!["c1"]);
    }

    #[test]
    fn begin_opens_one_transaction() {
        let mut store = store();
        store.begin().unwrap();
        store.begin().unwrap();
        assert!(store.in_transaction());
        store.rollback(Rollback::Transaction).unwrap();
        assert!(!store.in_transaction());
    }

    #[test]
    fn begin_fails_while_another_writer_holds_the_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("reddit.db");
        let mut first = SqliteStore::open(&path).unwrap();
        first.init_schema().unwrap();
        first.begin().unwrap();

        let mut second = SqliteStore::open(&path).unwrap();
        second.conn.busy_timeout(Duration::from_millis(10)).unwrap();
        assert!(matches!(second.begin(), Err(StoreError::Database(_))));
        assert!(!second.in_transaction());
    }

    #[test]
    fn commit_without_transaction_is_ok() {
        let mut store = store();
        assert!(store.commit().is_ok());
        assert!(store.rollback(Rollback::Transaction).is_ok());
    }

    #[test]
    fn count_rejects_unknown_table() {
        let store = store();
        assert_eq!(store.count("post").unwrap(), 0);
        assert!(store.count("post; DROP TABLE post").is_err());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("reddit.db");
        let store = SqliteStore::open(&path).unwrap();
        store.init_schema().unwrap();
        store.init_schema().unwrap();
        assert!(path.exists());
    }
}
