/// SQLite-backed key-value store

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    store::{KeyValueStore, WriteBatch},
};

/// Key-value store backed by a single SQLite table.
///
/// Batches commit inside one SQL transaction, which gives the atomicity the
/// [`KeyValueStore`] contract requires.
pub struct SqliteKeyValueStore {
    pool: Pool<Sqlite>,
}

impl SqliteKeyValueStore {
    /// Open or create a database file.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("synchronous", "NORMAL")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(format!("Failed to open database: {}", e)))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database, useful for tests. Limited to a single
    /// connection so every query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .map_err(|e| Error::Database(format!("Failed to open in-memory database: {}", e)))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, namespace: &str, keys: &[&str]) -> Result<HashMap<String, Bytes>> {
        let mut result = HashMap::new();
        for key in keys {
            let row = sqlx::query("SELECT value FROM kv_store WHERE namespace = ? AND key = ?")
                .bind(namespace)
                .bind(*key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to read {}/{}: {}", namespace, key, e)))?;

            if let Some(row) = row {
                let value: Vec<u8> = row.get(0);
                result.insert((*key).to_string(), Bytes::from(value));
            }
        }
        Ok(result)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        for (namespace, key, value) in batch.iter() {
            match value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO kv_store (namespace, key, value) VALUES (?, ?, ?)
                         ON CONFLICT (namespace, key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(namespace)
                    .bind(key)
                    .bind(value.to_vec())
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        Error::Database(format!("Failed to write {}/{}: {}", namespace, key, e))
                    })?;
                }
                None => {
                    sqlx::query("DELETE FROM kv_store WHERE namespace = ? AND key = ?")
                        .bind(namespace)
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| {
                            Error::Database(format!("Failed to delete {}/{}: {}", namespace, key, e))
                        })?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit transaction: {}", e)))
    }

    async fn entries(&self, namespace: &str) -> Result<Vec<(String, Bytes)>> {
        let rows = sqlx::query("SELECT key, value FROM kv_store WHERE namespace = ?")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to enumerate {}: {}", namespace, e)))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let key: String = row.get(0);
                let value: Vec<u8> = row.get(1);
                (key, Bytes::from(value))
            })
            .collect())
    }
}
