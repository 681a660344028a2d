//! SQLite-backed [`StateStore`]. Several processes on one host can share the
//! database file; expiry is evaluated on every read.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::StoreError;
use crate::store::StateStore;

pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2",
                    params![key, now_ms()],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let _ = conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expiry_ms(ttl)],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let _ = tx.execute(
                "DELETE FROM kv WHERE key = ?1 AND expires_at <= ?2",
                params![key, now_ms()],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expiry_ms(ttl)],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn delete_if_owner(&self, key: &str, owner: &[u8]) -> Result<bool, StoreError> {
        let key = key.to_string();
        let owner = owner.to_vec();
        self.blocking(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM kv WHERE key = ?1 AND value = ?2 AND expires_at > ?3",
                params![key, owner, now_ms()],
            )?;
            Ok(deleted == 1)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let _ = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.blocking(|conn| Ok(conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now_ms()])?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_get_overwrite() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", b"v1".to_vec(), TTL).await.unwrap();
        store.set("k", b"v2".to_vec(), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn expired_rows_are_invisible_and_replaceable() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", b"old".to_vec(), Duration::ZERO).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_if_absent("k", b"new".to_vec(), TTL).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn set_if_absent_only_once() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.set_if_absent("lock", b"a".to_vec(), TTL).await.unwrap());
        assert!(!store.set_if_absent("lock", b"b".to_vec(), TTL).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn delete_if_owner_compares_value() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("lock", b"a".to_vec(), TTL).await.unwrap();
        assert!(!store.delete_if_owner("lock", b"b").await.unwrap());
        assert!(store.delete_if_owner("lock", b"a").await.unwrap());
        assert!(!store.delete_if_owner("lock", b"a").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shared_file_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let a = Arc::new(SqliteStore::open(&path).unwrap());
        let b = Arc::new(SqliteStore::open(&path).unwrap());

        let (ra, rb) = tokio::join!(
            a.set_if_absent("tick", b"a".to_vec(), TTL),
            b.set_if_absent("tick", b"b".to_vec(), TTL),
        );
        assert!(ra.unwrap() ^ rb.unwrap());

        a.set("presence", b"{}".to_vec(), TTL).await.unwrap();
        assert_eq!(b.get("presence").await.unwrap(), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn purge_removes_expired() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("gone", vec![1], Duration::ZERO).await.unwrap();
        store.set("kept", vec![2], TTL).await.unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("kept").await.unwrap().is_some());
    }
}
