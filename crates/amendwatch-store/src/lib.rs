//! Idempotent, content-addressed snapshot log for listing payloads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use amendwatch_core::Snapshot;

pub const CRATE_NAME: &str = "amendwatch-store";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical JSON: recursively sorted object keys, compact separators,
/// stable scalar rendering. Equal payloads canonicalize identically
/// regardless of key order in the source document.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        JsonValue::Number(n) => out.push_str(&n.to_string()),
        JsonValue::String(_) => out.push_str(&value.to_string()),
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Content hash of a raw payload over its canonical form.
pub fn content_hash(payload: &JsonValue) -> String {
    sha256_hex(canonical_json(payload).as_bytes())
}

/// Input to `SnapshotRepo::record`.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub linked_opportunity_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,
    pub fetched_at: DateTime<Utc>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    pub raw_payload: JsonValue,
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub created: bool,
    pub snapshot: Snapshot,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {notice_id} has {have} snapshot(s); at least 2 are required")]
    InsufficientSnapshots { notice_id: String, have: usize },
    #[error("snapshot {snapshot_id} not found for listing {notice_id}")]
    SnapshotNotFound {
        notice_id: String,
        snapshot_id: Uuid,
    },
    #[error("io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt snapshot file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing snapshot: {0}")]
    Serialize(serde_json::Error),
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// Append-only snapshot log keyed by `notice_id`.
///
/// `record` writes a new row only when the content hash differs from the
/// latest existing row; re-ingesting an unchanged listing is a no-op. A
/// duplicate insert from two racing ingestions is benign: identical
/// content changes no downstream result.
#[async_trait]
pub trait SnapshotRepo: Send + Sync {
    async fn record(&self, new: NewSnapshot) -> Result<RecordOutcome, StoreError>;

    /// Full history for a listing, newest first.
    async fn history(&self, notice_id: &str) -> Result<Vec<Snapshot>, StoreError>;

    async fn latest(&self, notice_id: &str) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.history(notice_id).await?.into_iter().next())
    }

    async fn get(&self, notice_id: &str, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .history(notice_id)
            .await?
            .into_iter()
            .find(|s| s.id == snapshot_id))
    }

    /// The two most recent snapshots as `(from, to)`.
    async fn latest_pair(&self, notice_id: &str) -> Result<(Snapshot, Snapshot), StoreError> {
        let mut history = self.history(notice_id).await?;
        if history.len() < 2 {
            return Err(StoreError::InsufficientSnapshots {
                notice_id: notice_id.to_string(),
                have: history.len(),
            });
        }
        let to = history.remove(0);
        let from = history.remove(0);
        Ok((from, to))
    }
}

fn build_snapshot(new: NewSnapshot, hash: String) -> Snapshot {
    Snapshot {
        id: Uuid::new_v4(),
        notice_id: new.notice_id,
        solicitation_number: new.solicitation_number,
        linked_opportunity_id: new.linked_opportunity_id,
        owner_id: new.owner_id,
        fetched_at: new.fetched_at,
        posted_date: new.posted_date,
        response_deadline: new.response_deadline,
        content_hash: hash,
        raw_payload: new.raw_payload,
    }
}

/// Filesystem-backed store: one JSON document per snapshot under
/// `<root>/<notice_id>/`, written with an atomic temp-file rename.
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn listing_dir(&self, notice_id: &str) -> PathBuf {
        let sanitized: String = notice_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(sanitized)
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let dir = self.listing_dir(&snapshot.notice_id);
        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let stamp = snapshot.fetched_at.format("%Y%m%dT%H%M%S%3fZ");
        let final_path = dir.join(format!("{stamp}_{}.json", snapshot.id));
        let temp_path = dir.join(format!(".{}.tmp", snapshot.id));
        let bytes = serde_json::to_vec_pretty(snapshot).map_err(StoreError::Serialize)?;

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        file.write_all(&bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: temp_path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| StoreError::Io {
            path: temp_path.clone(),
            source,
        })?;
        drop(file);

        match fs::rename(&temp_path, &final_path).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::Io {
                    path: final_path,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl SnapshotRepo for FsSnapshotStore {
    async fn record(&self, new: NewSnapshot) -> Result<RecordOutcome, StoreError> {
        let hash = content_hash(&new.raw_payload);
        if let Some(latest) = self.latest(&new.notice_id).await? {
            if latest.content_hash == hash {
                return Ok(RecordOutcome {
                    created: false,
                    snapshot: latest,
                });
            }
        }

        let snapshot = build_snapshot(new, hash);
        self.write_snapshot(&snapshot).await?;
        Ok(RecordOutcome {
            created: true,
            snapshot,
        })
    }

    async fn history(&self, notice_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        let dir = self.listing_dir(notice_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let text = fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;
            let snapshot: Snapshot =
                serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
            snapshots.push(snapshot);
        }

        snapshots.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }
}

/// Postgres-backed store using runtime queries; selected when
/// `DATABASE_URL` is configured.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listing_snapshots (
                id UUID PRIMARY KEY,
                notice_id TEXT NOT NULL,
                solicitation_number TEXT,
                linked_opportunity_id UUID,
                owner_id UUID,
                fetched_at TIMESTAMPTZ NOT NULL,
                posted_date DATE,
                response_deadline DATE,
                content_hash TEXT NOT NULL,
                raw_payload JSONB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS listing_snapshots_notice_fetched
                ON listing_snapshots (notice_id, fetched_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO listing_snapshots
                (id, notice_id, solicitation_number, linked_opportunity_id, owner_id,
                 fetched_at, posted_date, response_deadline, content_hash, raw_payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(snapshot.id)
        .bind(&snapshot.notice_id)
        .bind(&snapshot.solicitation_number)
        .bind(snapshot.linked_opportunity_id)
        .bind(snapshot.owner_id)
        .bind(snapshot.fetched_at)
        .bind(snapshot.posted_date)
        .bind(snapshot.response_deadline)
        .bind(&snapshot.content_hash)
        .bind(&snapshot.raw_payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<Snapshot, sqlx::Error> {
    Ok(Snapshot {
        id: row.try_get("id")?,
        notice_id: row.try_get("notice_id")?,
        solicitation_number: row.try_get("solicitation_number")?,
        linked_opportunity_id: row.try_get("linked_opportunity_id")?,
        owner_id: row.try_get("owner_id")?,
        fetched_at: row.try_get("fetched_at")?,
        posted_date: row.try_get("posted_date")?,
        response_deadline: row.try_get("response_deadline")?,
        content_hash: row.try_get("content_hash")?,
        raw_payload: row.try_get("raw_payload")?,
    })
}

#[async_trait]
impl SnapshotRepo for PgSnapshotStore {
    async fn record(&self, new: NewSnapshot) -> Result<RecordOutcome, StoreError> {
        let hash = content_hash(&new.raw_payload);
        if let Some(latest) = self.latest(&new.notice_id).await? {
            if latest.content_hash == hash {
                return Ok(RecordOutcome {
                    created: false,
                    snapshot: latest,
                });
            }
        }

        let snapshot = build_snapshot(new, hash);
        self.insert(&snapshot).await?;
        Ok(RecordOutcome {
            created: true,
            snapshot,
        })
    }

    async fn history(&self, notice_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, notice_id, solicitation_number, linked_opportunity_id, owner_id,
                   fetched_at, posted_date, response_deadline, content_hash, raw_payload
              FROM listing_snapshots
             WHERE notice_id = $1
             ORDER BY fetched_at DESC, id DESC
            "#,
        )
        .bind(notice_id)
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            snapshots.push(snapshot_from_row(row)?);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn fetched_at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, minute, 0)
            .single()
            .unwrap()
    }

    fn new_snapshot(notice_id: &str, minute: u32, payload: JsonValue) -> NewSnapshot {
        NewSnapshot {
            notice_id: notice_id.to_string(),
            solicitation_number: Some("SOL-1".to_string()),
            linked_opportunity_id: None,
            owner_id: None,
            fetched_at: fetched_at(minute),
            posted_date: None,
            response_deadline: None,
            raw_payload: payload,
        }
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"d": 2, "c": [1, "x", null, true]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":[1,"x",null,true],"d":2},"b":1}"#
        );
    }

    #[test]
    fn content_hash_is_key_order_independent() {
        let left: JsonValue = serde_json::from_str(r#"{"a": 1, "b": {"x": [1, 2], "y": "z"}}"#).unwrap();
        let right: JsonValue = serde_json::from_str(r#"{"b": {"y": "z", "x": [1, 2]}, "a": 1}"#).unwrap();
        assert_eq!(content_hash(&left), content_hash(&right));

        let changed = json!({"a": 1, "b": {"x": [2, 1], "y": "z"}});
        assert_ne!(content_hash(&left), content_hash(&changed));
    }

    #[tokio::test]
    async fn recording_an_unchanged_payload_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());

        let first = store
            .record(new_snapshot("n-1", 0, json!({"title": "same"})))
            .await
            .expect("first record");
        let second = store
            .record(new_snapshot("n-1", 5, json!({"title": "same"})))
            .await
            .expect("second record");

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.snapshot.id, second.snapshot.id);
        assert_eq!(store.history("n-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn changed_payloads_append_to_the_log() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());

        store
            .record(new_snapshot("n-2", 0, json!({"responseDeadLine": "2025-06-01"})))
            .await
            .unwrap();
        let second = store
            .record(new_snapshot("n-2", 5, json!({"responseDeadLine": "2025-06-15"})))
            .await
            .unwrap();

        assert!(second.created);
        let history = store.history("n-2").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second.snapshot.id);
        assert_eq!(
            store.latest("n-2").await.unwrap().map(|s| s.id),
            Some(second.snapshot.id)
        );
    }

    #[tokio::test]
    async fn latest_pair_orders_from_older_to_newer() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());

        let first = store
            .record(new_snapshot("n-3", 0, json!({"v": 1})))
            .await
            .unwrap();
        let second = store
            .record(new_snapshot("n-3", 5, json!({"v": 2})))
            .await
            .unwrap();
        store
            .record(new_snapshot("n-3", 10, json!({"v": 3})))
            .await
            .unwrap();

        let (from, to) = store.latest_pair("n-3").await.unwrap();
        assert_eq!(from.id, second.snapshot.id);
        assert_ne!(to.id, first.snapshot.id);
        assert!(from.fetched_at < to.fetched_at);
    }

    #[tokio::test]
    async fn too_few_snapshots_is_a_typed_condition() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());

        match store.latest_pair("missing").await {
            Err(StoreError::InsufficientSnapshots { notice_id, have }) => {
                assert_eq!(notice_id, "missing");
                assert_eq!(have, 0);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        store
            .record(new_snapshot("n-4", 0, json!({"v": 1})))
            .await
            .unwrap();
        match store.latest_pair("n-4").await {
            Err(StoreError::InsufficientSnapshots { have, .. }) => assert_eq!(have, 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshots_are_retrievable_by_id() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());

        let outcome = store
            .record(new_snapshot("n-5", 0, json!({"v": 1})))
            .await
            .unwrap();

        let found = store.get("n-5", outcome.snapshot.id).await.unwrap();
        assert_eq!(found.map(|s| s.content_hash), Some(outcome.snapshot.content_hash));
        assert!(store.get("n-5", Uuid::new_v4()).await.unwrap().is_none());
    }
}
