//! SQLite store.
//!
//! A single database file with three tables:
//! - `user_profile`: one row (`id = 1`), created on first write
//! - `preferences`: keyed by `(category, key)`, carrying a write sequence
//! - `memories`: remembered items with an autoincrement id
//!
//! Relevance ranking runs in Rust over the candidate rows (see
//! [`crate::ranking`]) so both backends rank identically.

use crate::ranking;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jarvis_core::error::MemoryError;
use jarvis_core::memory::{
    MemoryRecord, MemoryStore, Preference, UserProfile, clamp_importance,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

fn unavailable(context: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::StoreUnavailable(format!("{context}: {e}"))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// A persistent memory store backed by SQLite (WAL mode).
pub struct SqliteMemoryStore {
    pool: SqlitePool,
    /// Serializes writers so read-modify-write operations stay atomic.
    write_lock: Mutex<()>,
    pref_seq: AtomicI64,
}

impl SqliteMemoryStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| unavailable("Failed to create database directory", e))?;
        }
        let options = SqliteConnectOptions::new().filename(path);
        let store = Self::connect_with(options, 4).await?;
        info!("SQLite memory store initialized at {}", path.display());
        Ok(store)
    }

    /// Open from a connection URL. `"sqlite::memory:"` gives an ephemeral
    /// database on a single connection.
    pub async fn connect(url: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| unavailable("Invalid SQLite path", e))?;
        let max = if url.contains(":memory:") { 1 } else { 4 };
        Self::connect_with(options, max).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, MemoryError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| unavailable("Failed to open SQLite", e))?;

        Self::from_pool(pool).await
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        run_migrations(&pool).await?;

        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM preferences")
            .fetch_one(&pool)
            .await
            .map_err(|e| unavailable("Preference sequence", e))?;
        let seq: i64 = row.try_get("seq").map_err(|e| unavailable("seq column", e))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            pref_seq: AtomicI64::new(seq),
        })
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<MemoryRecord, MemoryError> {
        let id: i64 = row.try_get("id").map_err(|e| unavailable("id column", e))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| unavailable("content column", e))?;
        let category: String = row
            .try_get("category")
            .map_err(|e| unavailable("category column", e))?;
        let importance: i64 = row
            .try_get("importance")
            .map_err(|e| unavailable("importance column", e))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| unavailable("created_at column", e))?;
        let last_accessed: String = row
            .try_get("last_accessed")
            .map_err(|e| unavailable("last_accessed column", e))?;

        Ok(MemoryRecord {
            id,
            content,
            category,
            importance: clamp_importance(importance as i32),
            created_at: parse_time(&created_at),
            last_accessed: parse_time(&last_accessed),
            score: 0.0,
        })
    }

    async fn load_profile(&self) -> Result<Option<UserProfile>, MemoryError> {
        let row = sqlx::query("SELECT name, facts, created_at, updated_at FROM user_profile WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable("Profile query", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let name: Option<String> = row.try_get("name").map_err(|e| unavailable("name column", e))?;
        let facts_json: String = row
            .try_get("facts")
            .map_err(|e| unavailable("facts column", e))?;
        let created_at: String = row
            .try_get("created_at")
            .map_err(|e| unavailable("created_at column", e))?;
        let updated_at: String = row
            .try_get("updated_at")
            .map_err(|e| unavailable("updated_at column", e))?;

        let facts: Vec<String> = serde_json::from_str(&facts_json)
            .map_err(|e| unavailable("Corrupted profile facts", e))?;

        Ok(Some(UserProfile {
            name,
            facts,
            created_at: Some(parse_time(&created_at)),
            updated_at: Some(parse_time(&updated_at)),
        }))
    }
}

/// Create tables and indexes.
async fn run_migrations(pool: &SqlitePool) -> Result<(), MemoryError> {
    let statements = [
        (
            "user_profile table",
            r#"
            CREATE TABLE IF NOT EXISTS user_profile (
                id          INTEGER PRIMARY KEY CHECK (id = 1),
                name        TEXT,
                facts       TEXT NOT NULL DEFAULT '[]',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        ),
        (
            "preferences table",
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                category    TEXT NOT NULL,
                key         TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                seq         INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (category, key)
            )
            "#,
        ),
        (
            "memories table",
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                content       TEXT NOT NULL,
                category      TEXT NOT NULL DEFAULT 'general',
                importance    INTEGER NOT NULL DEFAULT 5,
                created_at    TEXT NOT NULL,
                last_accessed TEXT NOT NULL
            )
            "#,
        ),
        (
            "importance index",
            "CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance DESC, created_at DESC)",
        ),
    ];

    for (what, sql) in statements {
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|e| unavailable(&format!("Migration failed ({what})"), e))?;
    }

    debug!("SQLite migrations complete");
    Ok(())
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn add_memory(
        &self,
        content: &str,
        category: &str,
        importance: i32,
    ) -> Result<i64, MemoryError> {
        let _w = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO memories (content, category, importance, created_at, last_accessed)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(content)
        .bind(category)
        .bind(clamp_importance(importance))
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("INSERT memory failed", e))?;

        let id = result.last_insert_rowid();
        debug!(id, category, "Stored memory");
        Ok(id)
    }

    async fn search_memories(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let rows = sqlx::query("SELECT * FROM memories")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("Memory search", e))?;
        let records = rows
            .iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        let mut results = ranking::rank(records, query, limit);
        if results.is_empty() {
            return Ok(results);
        }

        let now = Utc::now();
        let stamp = now.to_rfc3339();
        let _w = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable("Begin transaction", e))?;
        for r in &mut results {
            sqlx::query("UPDATE memories SET last_accessed = ?1 WHERE id = ?2")
                .bind(&stamp)
                .bind(r.id)
                .execute(&mut *tx)
                .await
                .map_err(|e| unavailable("Touch memory", e))?;
            r.last_accessed = now;
        }
        tx.commit()
            .await
            .map_err(|e| unavailable("Commit transaction", e))?;

        Ok(results)
    }

    async fn recent_memories(&self, limit: usize) -> Result<Vec<MemoryRecord>, MemoryError> {
        let rows = sqlx::query("SELECT * FROM memories ORDER BY created_at DESC, id DESC LIMIT ?1")
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable("Recent memories", e))?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn important_memories(
        &self,
        min_importance: i32,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM memories
            WHERE importance >= ?1
            ORDER BY importance DESC, created_at DESC, id DESC
            LIMIT ?2
            "#,
        )
        .bind(min_importance)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("Important memories", e))?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn delete_memory(&self, id: i64) -> Result<bool, MemoryError> {
        let _w = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM memories WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable("DELETE memory failed", e))?;
        let deleted = result.rows_affected() > 0;
        debug!(id, deleted, "Deleted memory");
        Ok(deleted)
    }

    async fn memory_count(&self) -> Result<usize, MemoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM memories")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unavailable("COUNT", e))?;
        let cnt: i64 = row.try_get("cnt").map_err(|e| unavailable("cnt column", e))?;
        Ok(cnt as usize)
    }

    async fn get_profile(&self) -> Result<UserProfile, MemoryError> {
        Ok(self.load_profile().await?.unwrap_or_default())
    }

    async fn set_name(&self, name: &str) -> Result<(), MemoryError> {
        let _w = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO user_profile (id, name, facts, created_at, updated_at)
            VALUES (1, ?1, '[]', ?2, ?2)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("Set name failed", e))?;
        Ok(())
    }

    async fn add_user_fact(&self, fact: &str) -> Result<(), MemoryError> {
        let _w = self.write_lock.lock().await;
        let mut facts = self
            .load_profile()
            .await?
            .map(|p| p.facts)
            .unwrap_or_default();
        if facts.iter().any(|f| f == fact) {
            return Ok(());
        }
        facts.push(fact.to_string());
        let facts_json =
            serde_json::to_string(&facts).map_err(|e| unavailable("Facts serialization", e))?;

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO user_profile (id, name, facts, created_at, updated_at)
            VALUES (1, NULL, ?1, ?2, ?2)
            ON CONFLICT(id) DO UPDATE SET
                facts = excluded.facts,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&facts_json)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("Add fact failed", e))?;
        Ok(())
    }

    async fn get_preference(
        &self,
        category: &str,
        key: &str,
    ) -> Result<Option<String>, MemoryError> {
        let row = sqlx::query("SELECT value FROM preferences WHERE category = ?1 AND key = ?2")
            .bind(category)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| unavailable("Preference lookup", e))?;
        row.map(|r| r.try_get("value").map_err(|e| unavailable("value column", e)))
            .transpose()
    }

    async fn get_all_preferences(&self) -> Result<Vec<Preference>, MemoryError> {
        let rows = sqlx::query(
            "SELECT category, key, value, updated_at, seq FROM preferences ORDER BY category, key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| unavailable("Preference listing", e))?;

        rows.iter()
            .map(|row| {
                let updated_at: String = row
                    .try_get("updated_at")
                    .map_err(|e| unavailable("updated_at column", e))?;
                Ok(Preference {
                    category: row
                        .try_get("category")
                        .map_err(|e| unavailable("category column", e))?,
                    key: row.try_get("key").map_err(|e| unavailable("key column", e))?,
                    value: row.try_get("value").map_err(|e| unavailable("value column", e))?,
                    updated_at: parse_time(&updated_at),
                    seq: row.try_get("seq").map_err(|e| unavailable("seq column", e))?,
                })
            })
            .collect()
    }

    async fn set_preference(
        &self,
        category: &str,
        key: &str,
        value: &str,
    ) -> Result<(), MemoryError> {
        let _w = self.write_lock.lock().await;
        let seq = self.pref_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO preferences (category, key, value, updated_at, seq)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(category, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at,
                seq = excluded.seq
            WHERE excluded.seq > preferences.seq
            "#,
        )
        .bind(category)
        .bind(key)
        .bind(value)
        .bind(&now)
        .bind(seq)
        .execute(&self.pool)
        .await
        .map_err(|e| unavailable("Set preference failed", e))?;
        debug!(category, key, seq, "Stored preference");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> SqliteMemoryStore {
        SqliteMemoryStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn add_and_count() {
        let store = test_store().await;
        let a = store.add_memory("first", "general", 5).await.unwrap();
        let b = store.add_memory("second", "general", 5).await.unwrap();
        assert!(b > a);
        assert_eq!(store.memory_count().await.unwrap(), 2);
        let recent = store.recent_memories(1).await.unwrap();
        assert_eq!(recent[0].id, b);
    }

    #[tokio::test]
    async fn delete_memory_reports_whether_it_existed() {
        let store = test_store().await;
        let a = store.add_memory("keep me", "general", 5).await.unwrap();
        let b = store.add_memory("forget me", "general", 5).await.unwrap();

        assert!(store.delete_memory(b).await.unwrap());
        assert!(!store.delete_memory(b).await.unwrap());
        assert!(!store.delete_memory(999).await.unwrap());
        assert_eq!(store.memory_count().await.unwrap(), 1);
        assert_eq!(store.recent_memories(5).await.unwrap()[0].id, a);
    }

    #[tokio::test]
    async fn important_memories_filter_and_order() {
        let store = test_store().await;
        store.add_memory("trivia", "general", 2).await.unwrap();
        let older = store.add_memory("allergic to peanuts", "health", 9).await.unwrap();
        let newer = store.add_memory("flight on friday", "travel", 9).await.unwrap();
        let top = store.add_memory("emergency contact is Alex", "people", 10).await.unwrap();

        let ids: Vec<i64> = store
            .important_memories(7, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![top, newer, older]);
        assert_eq!(store.important_memories(7, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stats_reflect_profile_preferences_and_memories() {
        let store = test_store().await;
        let empty = store.stats().await.unwrap();
        assert!(!empty.has_profile);
        assert_eq!(empty.memory_count, 0);

        store.set_name("Sam").await.unwrap();
        store.add_user_fact("works nights").await.unwrap();
        store.set_preference("style", "tone", "brief").await.unwrap();
        store.set_preference("style", "tone", "chatty").await.unwrap();
        store.add_memory("likes dark mode", "ui", 8).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.user_name.as_deref(), Some("Sam"));
        assert_eq!(stats.fact_count, 1);
        assert_eq!(stats.preference_count, 1);
        assert_eq!(stats.memory_count, 1);
    }

    #[tokio::test]
    async fn importance_is_clamped_on_write() {
        let store = test_store().await;
        store.add_memory("too loud", "general", 42).await.unwrap();
        store.add_memory("too quiet", "general", -1).await.unwrap();
        let all = store.search_memories("", 10).await.unwrap();
        assert_eq!(all[0].importance, 10);
        assert_eq!(all[1].importance, 0);
    }

    #[tokio::test]
    async fn search_ranks_and_limits() {
        let store = test_store().await;
        store.add_memory("likes dark mode", "preference", 8).await.unwrap();
        store.add_memory("prefers concise answers", "preference", 3).await.unwrap();
        for i in 0..10 {
            store.add_memory(&format!("theme idea {i}"), "general", 1).await.unwrap();
        }

        let results = store.search_memories("What UI theme do I like?", 3).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.content != "prefers concise answers"));

        let none = store.search_memories("astronomy", 5).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn search_touches_last_accessed() {
        let store = test_store().await;
        let id = store.add_memory("walks the dog at noon", "general", 5).await.unwrap();
        let before = store.recent_memories(1).await.unwrap()[0].last_accessed;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let hit = store.search_memories("dog", 1).await.unwrap();
        assert_eq!(hit[0].id, id);
        let after = store.recent_memories(1).await.unwrap()[0].last_accessed;
        assert!(after > before);
    }

    #[tokio::test]
    async fn profile_created_lazily() {
        let store = test_store().await;
        assert_eq!(store.get_profile().await.unwrap(), UserProfile::default());

        store.add_user_fact("Allergic to peanuts").await.unwrap();
        store.add_user_fact("Allergic to peanuts").await.unwrap();
        store.set_name("Sam").await.unwrap();
        store.set_name("Samantha").await.unwrap();

        let profile = store.get_profile().await.unwrap();
        assert_eq!(profile.name.as_deref(), Some("Samantha"));
        assert_eq!(profile.facts, vec!["Allergic to peanuts"]);
        assert!(profile.updated_at >= profile.created_at);
    }

    #[tokio::test]
    async fn preference_upsert_last_write_wins() {
        let store = test_store().await;
        store.set_preference("llm", "system_prompt", "Be formal").await.unwrap();
        store.set_preference("llm", "system_prompt", "Be brief").await.unwrap();
        store.set_preference("ui", "theme", "dark").await.unwrap();

        let prefs = store.get_all_preferences().await.unwrap();
        assert_eq!(prefs.len(), 2);
        assert_eq!(prefs[0].category, "llm");
        assert_eq!(prefs[0].value, "Be brief");
        assert_eq!(
            store.get_preference("llm", "system_prompt").await.unwrap().as_deref(),
            Some("Be brief")
        );
        assert_eq!(store.get_preference("ui", "font").await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_preference_writes_keep_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteMemoryStore::open(&dir.path().join("jarvis.db")).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.set_preference("ui", "theme", &format!("v{i}")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let prefs = store.get_all_preferences().await.unwrap();
        assert_eq!(prefs.len(), 1);
        assert_eq!(prefs[0].seq, 16);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jarvis.db");
        {
            let store = SqliteMemoryStore::open(&path).await.unwrap();
            store.set_name("Sam").await.unwrap();
            store.add_memory("likes dark mode", "preference", 8).await.unwrap();
            store.set_preference("system", "city", "Arlington").await.unwrap();
        }
        let store = SqliteMemoryStore::open(&path).await.unwrap();
        assert_eq!(store.get_profile().await.unwrap().name.as_deref(), Some("Sam"));
        assert_eq!(store.memory_count().await.unwrap(), 1);
        // The write sequence resumes after the stored maximum.
        store.set_preference("system", "city", "Boston").await.unwrap();
        let prefs = store.get_all_preferences().await.unwrap();
        assert_eq!(prefs[0].value, "Boston");
        assert_eq!(prefs[0].seq, 2);
    }

    #[tokio::test]
    async fn build_context_example() {
        let store = test_store().await;
        store.set_name("Sam").await.unwrap();
        store.add_memory("likes dark mode", "preference", 8).await.unwrap();
        store.add_memory("prefers concise answers", "preference", 3).await.unwrap();

        let first = store.build_context("What UI theme do I like?", 256).await.unwrap();
        let second = store.build_context("What UI theme do I like?", 256).await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("User's name is Sam."));
        assert!(first.find("likes dark mode").unwrap() < first.find("prefers concise answers").unwrap());
    }

    #[tokio::test]
    async fn corrupted_database_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.db");
        std::fs::write(&path, b"definitely not a sqlite database, just some bytes").unwrap();
        let err = SqliteMemoryStore::open(&path).await.err().unwrap();
        assert!(matches!(err, MemoryError::StoreUnavailable(_)));
    }
}
