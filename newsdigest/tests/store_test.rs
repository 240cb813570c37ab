use chrono::{Duration, TimeZone, Utc};
use common::init_db_pool;
use newsdigest::error::StoreError;
use newsdigest::normalize::{canonical_url, normalize_title, title_hash, url_hash};
use newsdigest::storage::{DedupRecord, DedupStore, InsertGuard, InsertOutcome};
use tempfile::TempDir;

// Helper to open a store in a fresh temp directory
async fn setup_store(dir: &TempDir) -> DedupStore {
    let db_path = dir.path().join("dedup.sqlite");
    let pool = init_db_pool(db_path.to_str().unwrap()).await.expect("init pool");
    DedupStore::open(pool).await.expect("open store")
}

fn record(title: &str, link: &str, first_seen_hours_ago: i64, embedding: Option<Vec<f32>>) -> DedupRecord {
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
    let first_seen = now - Duration::hours(first_seen_hours_ago);
    let normalized = normalize_title(title);
    let canonical = canonical_url(link).unwrap();
    let t_hash = title_hash(&normalized);
    DedupRecord {
        record_key: DedupRecord::key_for(&t_hash, first_seen),
        normalized_title: normalized,
        url_hash: url_hash(&canonical),
        canonical_url: canonical,
        title_hash: t_hash,
        embedding,
        category: "Banking".into(),
        title: title.into(),
        source: None,
        published_at: first_seen,
        first_seen_at: first_seen,
    }
}

#[tokio::test]
async fn records_survive_reopening_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let rec = record("新光金控Q4獲利創新高", "https://news.example.com/a/1", 1, Some(vec![0.1, 0.2, 0.3]));
    {
        let store = setup_store(&dir).await;
        assert_eq!(store.insert_if_absent(&rec, InsertGuard::AnyHash).await.unwrap(), InsertOutcome::Inserted);
        store.pool().close().await;
    }

    let store = setup_store(&dir).await;
    assert_eq!(store.count().await.unwrap(), 1);
    let found = store.find_by_title_hash(&rec.title_hash).await.unwrap().expect("record");
    assert_eq!(found, rec);
    let by_url = store.find_by_url_hash(&rec.url_hash).await.unwrap().expect("record");
    assert_eq!(by_url.record_key, rec.record_key);
    assert!(store.find_by_title_hash("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn compare_and_insert_rejects_matching_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir).await;

    let first = record("Bank profit hits record", "https://news.example.com/a/1", 2, None);
    assert_eq!(store.insert_if_absent(&first, InsertGuard::AnyHash).await.unwrap(), InsertOutcome::Inserted);

    // Same title, different link and time
    let same_title = record("Bank profit hits record", "https://other.example.com/x", 1, None);
    assert_eq!(store.insert_if_absent(&same_title, InsertGuard::AnyHash).await.unwrap(), InsertOutcome::AlreadyPresent);

    // Different title, same link with tracking parameters
    let same_link = record("Something else entirely", "https://news.example.com/a/1?utm_source=x", 1, None);
    assert_eq!(store.insert_if_absent(&same_link, InsertGuard::AnyHash).await.unwrap(), InsertOutcome::AlreadyPresent);

    assert_eq!(store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn both_hashes_guard_only_blocks_the_same_item() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir).await;

    let first = record("Bank profit hits record", "https://news.example.com/a/1", 3, None);
    assert_eq!(store.insert_if_absent(&first, InsertGuard::BothHashes).await.unwrap(), InsertOutcome::Inserted);

    let same_link = record("Something else entirely", "https://news.example.com/a/1", 2, None);
    assert_eq!(store.insert_if_absent(&same_link, InsertGuard::BothHashes).await.unwrap(), InsertOutcome::Inserted);

    let same_item = record("Bank profit hits record", "https://news.example.com/a/1?utm_source=x", 1, None);
    assert_eq!(store.insert_if_absent(&same_item, InsertGuard::BothHashes).await.unwrap(), InsertOutcome::AlreadyPresent);

    assert_eq!(store.count().await.unwrap(), 2);
    assert_eq!(InsertGuard::for_min_signals(1), InsertGuard::AnyHash);
    assert_eq!(InsertGuard::for_min_signals(3), InsertGuard::BothHashes);
}

#[tokio::test]
async fn eviction_removes_only_expired_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir).await;
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();

    let old = record("Old story", "https://news.example.com/old", 100, None);
    let fresh = record("Fresh story", "https://news.example.com/fresh", 10, None);
    store.insert_if_absent(&old, InsertGuard::AnyHash).await.unwrap();
    store.insert_if_absent(&fresh, InsertGuard::AnyHash).await.unwrap();

    let evicted = store.evict_older_than(now - Duration::hours(72)).await.unwrap();
    assert_eq!(evicted, 1);
    assert!(store.find_by_title_hash(&old.title_hash).await.unwrap().is_none());
    assert!(store.find_by_title_hash(&fresh.title_hash).await.unwrap().is_some());

    // Idempotent
    assert_eq!(store.evict_older_than(now - Duration::hours(72)).await.unwrap(), 0);
}

#[tokio::test]
async fn window_is_newest_first_and_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir).await;
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();

    for (i, hours) in [30, 5, 20, 1].iter().enumerate() {
        let rec = record(&format!("Story number {}", i), &format!("https://news.example.com/{}", i), *hours, None);
        store.insert_if_absent(&rec, InsertGuard::AnyHash).await.unwrap();
    }

    let window = store.load_window(now - Duration::hours(24), 10).await.unwrap();
    let ages: Vec<i64> = window.iter().map(|r| (now - r.first_seen_at).num_hours()).collect();
    assert_eq!(ages, vec![1, 5, 20]);

    let limited = store.load_window(now - Duration::hours(48), 2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!((now - limited[0].first_seen_at).num_hours(), 1);
}

#[tokio::test]
async fn corrupt_embedding_blob_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = setup_store(&dir).await;
    let now = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();

    sqlx::query(
        "INSERT INTO dedup_records (record_key, normalized_title, canonical_url, title_hash, url_hash, \
         embedding, category, title, source, published_ms, first_seen_ms) \
         VALUES ('k:1', 'broken', 'https://x.example/', 'th', 'uh', ?, 'Other', 'Broken', NULL, ?, ?)",
    )
    .bind(vec![1u8, 2, 3, 4, 5, 6, 7])
    .bind(now.timestamp_millis())
    .bind(now.timestamp_millis())
    .execute(store.pool())
    .await
    .expect("raw insert");

    let err = store.load_window(now - Duration::hours(1), 10).await.unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { .. }));
    assert!(matches!(store.find_by_url_hash("uh").await, Err(StoreError::Corrupt { .. })));
}
