use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::similarity::WindowEntry;

/// A surfaced item as persisted by the Dedup Store. Never updated after
/// insertion; removed only by eviction.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupRecord {
    /// `<title_hash>:<first_seen_ms>`
    pub record_key: String,
    pub normalized_title: String,
    pub canonical_url: String,
    pub title_hash: String,
    pub url_hash: String,
    pub embedding: Option<Vec<f32>>,
    pub category: String,
    pub title: String,
    pub source: Option<String>,
    pub published_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
}

impl DedupRecord {
    pub fn key_for(title_hash: &str, first_seen_at: DateTime<Utc>) -> String {
        format!("{}:{}", title_hash, first_seen_at.timestamp_millis())
    }

    pub fn window_entry(&self) -> WindowEntry {
        WindowEntry::new(
            self.title_hash.clone(),
            self.url_hash.clone(),
            self.normalized_title.clone(),
            self.embedding.clone(),
            self.first_seen_at,
        )
    }
}

/// Database row for dedup_records
#[derive(Debug, Clone, sqlx::FromRow)]
struct DedupRow {
    id: i64,
    record_key: String,
    normalized_title: String,
    canonical_url: String,
    title_hash: String,
    url_hash: String,
    embedding: Option<Vec<u8>>,
    category: String,
    title: String,
    source: Option<String>,
    published_ms: i64,
    first_seen_ms: i64,
}

impl DedupRow {
    fn into_record(self) -> Result<DedupRecord, StoreError> {
        let id = self.id;
        let embedding = self
            .embedding
            .map(|bytes| bytes_to_f32_vec(&bytes).ok_or(StoreError::Corrupt {
                id,
                reason: format!("embedding blob of {} bytes", bytes.len()),
            }))
            .transpose()?;
        Ok(DedupRecord {
            record_key: self.record_key,
            normalized_title: self.normalized_title,
            canonical_url: self.canonical_url,
            title_hash: self.title_hash,
            url_hash: self.url_hash,
            embedding,
            category: self.category,
            title: self.title,
            source: self.source,
            published_at: millis_to_datetime(self.published_ms, id, "published_ms")?,
            first_seen_at: millis_to_datetime(self.first_seen_ms, id, "first_seen_ms")?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, record_key, normalized_title, canonical_url, title_hash, url_hash, \
     embedding, category, title, source, published_ms, first_seen_ms";

/// Outcome of a compare-and-insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record matching the guard already exists
    AlreadyPresent,
}

/// Which stored hashes block a compare-and-insert. Mirrors the admission
/// rule: with a single required signal either hash is enough to call the
/// item a duplicate, with corroboration only a record sharing both is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertGuard {
    AnyHash,
    BothHashes,
}

impl InsertGuard {
    pub fn for_min_signals(min_signals: usize) -> Self {
        if min_signals <= 1 {
            InsertGuard::AnyHash
        } else {
            InsertGuard::BothHashes
        }
    }

    fn predicate(self) -> &'static str {
        match self {
            InsertGuard::AnyHash => "title_hash = ? OR url_hash = ?",
            InsertGuard::BothHashes => "title_hash = ? AND url_hash = ?",
        }
    }
}

/// Durable, indexed record of previously surfaced items.
#[derive(Debug, Clone)]
pub struct DedupStore {
    pool: SqlitePool,
}

impl DedupStore {
    /// Ensure the schema exists and the database passes a quick integrity check.
    pub async fn open(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.ensure_schema().await?;
        store.check_integrity().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// CREATE TABLE / INDEX IF NOT EXISTS; idempotent and safe to call at startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        debug!("storage: ensuring dedup schema");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_key TEXT NOT NULL UNIQUE,
                normalized_title TEXT NOT NULL,
                canonical_url TEXT NOT NULL,
                title_hash TEXT NOT NULL,
                url_hash TEXT NOT NULL,
                embedding BLOB,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                source TEXT,
                published_ms INTEGER NOT NULL,
                first_seen_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_dedup_title_hash ON dedup_records (title_hash)",
            "CREATE INDEX IF NOT EXISTS idx_dedup_url_hash ON dedup_records (url_hash)",
            "CREATE INDEX IF NOT EXISTS idx_dedup_first_seen ON dedup_records (first_seen_ms)",
        ] {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn check_integrity(&self) -> Result<(), StoreError> {
        let result: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if result != "ok" {
            return Err(StoreError::Integrity(result));
        }
        Ok(())
    }

    /// Insert `record` unless a stored record matches it under `guard`.
    /// Check and write happen in one statement, so two overlapping runs
    /// cannot both admit the same item.
    pub async fn insert_if_absent(
        &self,
        record: &DedupRecord,
        guard: InsertGuard,
    ) -> Result<InsertOutcome, StoreError> {
        let embedding = record.embedding.as_deref().map(f32_vec_to_bytes);
        let query = format!(
            "INSERT INTO dedup_records \
                (record_key, normalized_title, canonical_url, title_hash, url_hash, \
                 embedding, category, title, source, published_ms, first_seen_ms) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM dedup_records WHERE {})",
            guard.predicate()
        );
        let result = sqlx::query(&query)
            .bind(&record.record_key)
            .bind(&record.normalized_title)
            .bind(&record.canonical_url)
            .bind(&record.title_hash)
            .bind(&record.url_hash)
            .bind(embedding)
            .bind(&record.category)
            .bind(&record.title)
            .bind(&record.source)
            .bind(record.published_at.timestamp_millis())
            .bind(record.first_seen_at.timestamp_millis())
            .bind(&record.title_hash)
            .bind(&record.url_hash)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyPresent)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    pub async fn find_by_title_hash(&self, hash: &str) -> Result<Option<DedupRecord>, StoreError> {
        self.find_one("title_hash", hash).await
    }

    pub async fn find_by_url_hash(&self, hash: &str) -> Result<Option<DedupRecord>, StoreError> {
        self.find_one("url_hash", hash).await
    }

    async fn find_one(&self, column: &'static str, hash: &str) -> Result<Option<DedupRecord>, StoreError> {
        let query = format!(
            "SELECT {} FROM dedup_records WHERE {} = ? ORDER BY first_seen_ms DESC LIMIT 1",
            SELECT_COLUMNS, column
        );
        sqlx::query_as::<_, DedupRow>(&query)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .map(DedupRow::into_record)
            .transpose()
    }

    /// Records first seen at or after `since`, newest first, at most `limit`.
    pub async fn load_window(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<DedupRecord>, StoreError> {
        let query = format!(
            "SELECT {} FROM dedup_records WHERE first_seen_ms >= ? ORDER BY first_seen_ms DESC, id DESC LIMIT ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, DedupRow>(&query)
            .bind(since.timestamp_millis())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DedupRow::into_record).collect()
    }

    /// Delete records first seen before `cutoff`. Returns the number removed.
    pub async fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dedup_records WHERE first_seen_ms < ?")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        let evicted = result.rows_affected();
        if evicted > 0 {
            info!(evicted, cutoff = %cutoff, "storage: evicted expired dedup records");
        }
        Ok(evicted)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM dedup_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

/// Convert Vec<f32> to Vec<u8> (Little Endian bytes) for BLOB storage
fn f32_vec_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_f32_vec(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

fn millis_to_datetime(ms: i64, id: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("{} out of range: {}", column, ms),
    })
}
