//! SQLite persistence for committed anchors and acknowledged outputs.

use std::ops::DerefMut;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::Txid;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tokio::fs;

use anchorage_prover::{AckKey, AnchorBlock};

/// An error that can occur when using the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to encode or decode a record: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Durable ledger state the app server restores on start-up.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn add_anchor(&self, index: u64, anchor: &AnchorBlock) -> Result<(), StoreError>;
    async fn get_anchor(&self, index: u64) -> Result<Option<AnchorBlock>, StoreError>;
    /// All anchors ordered by index
    async fn get_anchors(&self) -> Result<Vec<AnchorBlock>, StoreError>;
    async fn get_last_anchor(&self) -> Result<Option<(u64, AnchorBlock)>, StoreError>;
    async fn add_acknowledgement(&self, key: &AckKey) -> Result<(), StoreError>;
    async fn get_acknowledgements(&self) -> Result<Vec<AckKey>, StoreError>;
}

/// SQLite busy timeout in milliseconds
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Maximum number of concurrent readers (size of the connection pool)
const SQLITE_MAX_CONCURRENT_READERS: u32 = 10;

/// SQLite-backed store with single-writer and multi-reader pools.
/// - WAL mode for concurrent readers during writes
/// - Single writer (max_connections = 1)
#[derive(Debug, Clone)]
pub struct AppStore {
    pool: Pool<Sqlite>,
}

impl AppStore {
    /// Create a store for a single writer, creating the file and tables if missing
    pub async fn single_atomic_writer<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        // Writer pool: single connection ensures single-writer semantics
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create a store for multiple concurrent readers
    pub fn multiple_concurrent_readers<P: AsRef<Path>>(path: P) -> Self {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .read_only(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(SQLITE_MAX_CONCURRENT_READERS)
            .connect_lazy_with(options);

        Self { pool }
    }

    /// Acquire a connection from the pool.
    /// NOTE: if there's no available connection this function will fail after acquire timeout.
    async fn acquire_connection(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        self.pool.acquire().await
    }

    /// Initialize the store by creating the tables if missing
    async fn init(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.acquire_connection().await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS anchors (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                anchor BLOB NOT NULL
            );"#,
        )
        .execute(conn.deref_mut())
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS acknowledgements (
                tx_hash TEXT NOT NULL,
                use_tag INTEGER NOT NULL,
                PRIMARY KEY (tx_hash, use_tag)
            );"#,
        )
        .execute(conn.deref_mut())
        .await?;
        Ok(())
    }
}

fn decode_anchor(data: &[u8]) -> Result<AnchorBlock, StoreError> {
    bincode::deserialize(data).map_err(Into::into)
}

#[async_trait]
impl LedgerStore for AppStore {
    async fn add_anchor(&self, index: u64, anchor: &AnchorBlock) -> Result<(), StoreError> {
        let mut conn = self.acquire_connection().await?;
        let data = bincode::serialize(anchor)?;
        sqlx::query("INSERT INTO anchors (idx, hash, anchor) VALUES (?, ?, ?)")
            .bind(index as i64)
            .bind(anchor.anchor_block_hash.to_string())
            .bind(data)
            .execute(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn get_anchor(&self, index: u64) -> Result<Option<AnchorBlock>, StoreError> {
        let mut conn = self.acquire_connection().await?;
        let row = sqlx::query("SELECT anchor FROM anchors WHERE idx = ?")
            .bind(index as i64)
            .fetch_optional(conn.deref_mut())
            .await?;
        row.map(|row| decode_anchor(&row.get::<Vec<u8>, _>("anchor")))
            .transpose()
    }

    async fn get_anchors(&self) -> Result<Vec<AnchorBlock>, StoreError> {
        let mut conn = self.acquire_connection().await?;
        let rows = sqlx::query("SELECT idx, anchor FROM anchors ORDER BY idx ASC")
            .fetch_all(conn.deref_mut())
            .await?;
        rows.iter()
            .enumerate()
            .map(|(expected, row)| {
                let index: i64 = row.get("idx");
                if index != expected as i64 {
                    return Err(StoreError::Corrupted(format!(
                        "anchor #{expected} is missing, found #{index}"
                    )));
                }
                decode_anchor(&row.get::<Vec<u8>, _>("anchor"))
            })
            .collect()
    }

    async fn get_last_anchor(&self) -> Result<Option<(u64, AnchorBlock)>, StoreError> {
        let mut conn = self.acquire_connection().await?;
        let row = sqlx::query("SELECT idx, anchor FROM anchors ORDER BY idx DESC LIMIT 1")
            .fetch_optional(conn.deref_mut())
            .await?;
        row.map(|row| {
            let index: i64 = row.get("idx");
            Ok((index as u64, decode_anchor(&row.get::<Vec<u8>, _>("anchor"))?))
        })
        .transpose()
    }

    async fn add_acknowledgement(&self, key: &AckKey) -> Result<(), StoreError> {
        let mut conn = self.acquire_connection().await?;
        sqlx::query("INSERT INTO acknowledgements (tx_hash, use_tag) VALUES (?, ?)")
            .bind(key.tx_hash.to_string())
            .bind(key.use_tag)
            .execute(conn.deref_mut())
            .await?;
        Ok(())
    }

    async fn get_acknowledgements(&self) -> Result<Vec<AckKey>, StoreError> {
        let mut conn = self.acquire_connection().await?;
        let rows = sqlx::query("SELECT tx_hash, use_tag FROM acknowledgements")
            .fetch_all(conn.deref_mut())
            .await?;
        rows.iter()
            .map(|row| {
                let tx_hash: String = row.get("tx_hash");
                Ok(AckKey {
                    tx_hash: Txid::from_str(&tx_hash)
                        .map_err(|e| StoreError::Corrupted(format!("{tx_hash}: {e}")))?,
                    use_tag: row.get("use_tag"),
                })
            })
            .collect()
    }
}
