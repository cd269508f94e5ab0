//! End-to-end orchestration: scan ingestion, diff and impact resolution.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use amendwatch_core::{ProposalSection, Snapshot};
use amendwatch_diff::{diff_snapshots, ListingDiff};
use amendwatch_feed::{parse_opportunity, FeedClient, FeedConfig, SearchParams};
use amendwatch_impact::{ImpactAnalyzer, ImpactReport, ImpactRules};
use amendwatch_store::{
    FsSnapshotStore, NewSnapshot, PgSnapshotStore, SnapshotRepo, StoreError,
};

pub const CRATE_NAME: &str = "amendwatch-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub database_url: Option<String>,
    pub rules_path: PathBuf,
    pub feed: FeedConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("AMENDWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/snapshots")),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            rules_path: std::env::var("AMENDWATCH_RULES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules/impact.yaml")),
            feed: FeedConfig::from_env(),
        }
    }
}

/// Postgres when `DATABASE_URL` is configured, filesystem otherwise.
pub async fn open_repo(config: &PipelineConfig) -> Result<Arc<dyn SnapshotRepo>> {
    if let Some(url) = &config.database_url {
        let store = PgSnapshotStore::connect(url)
            .await
            .context("connecting snapshot database")?;
        store.migrate().await.context("migrating snapshot schema")?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(FsSnapshotStore::new(config.data_dir.clone())))
    }
}

/// Tuned rules when the file exists, compiled defaults otherwise.
pub fn load_rules(config: &PipelineConfig) -> Result<ImpactRules> {
    if config.rules_path.exists() {
        ImpactRules::from_yaml_file(&config.rules_path)
    } else {
        Ok(ImpactRules::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub created: bool,
    pub snapshot_id: Uuid,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_records: usize,
    pub skipped_records: usize,
    pub created_snapshots: usize,
    pub unchanged_listings: usize,
    pub outcomes: Vec<ScanOutcome>,
}

/// One scan: fetch the feed, then record a snapshot per parseable listing.
///
/// A malformed record is logged and skipped; it never aborts the batch.
pub async fn run_scan(
    repo: &dyn SnapshotRepo,
    feed: &FeedClient,
    params: &SearchParams,
    owner_id: Option<Uuid>,
) -> Result<ScanSummary> {
    let started_at = Utc::now();
    let records = feed.fetch(params).await.context("fetching listing feed")?;

    let mut skipped_records = 0usize;
    let mut created_snapshots = 0usize;
    let mut unchanged_listings = 0usize;
    let mut outcomes = Vec::with_capacity(records.len());

    for record in &records {
        let opportunity = match parse_opportunity(record) {
            Ok(opportunity) => opportunity,
            Err(err) => {
                warn!(notice_id = %record.notice_id, error = %err, "skipping unparseable record");
                skipped_records += 1;
                continue;
            }
        };

        let outcome = repo
            .record(NewSnapshot {
                notice_id: record.notice_id.clone(),
                solicitation_number: record.solicitation_number.clone(),
                linked_opportunity_id: None,
                owner_id,
                fetched_at: Utc::now(),
                posted_date: opportunity.posted_date,
                response_deadline: opportunity.response_deadline,
                raw_payload: record.payload.clone(),
            })
            .await
            .with_context(|| format!("recording snapshot for {}", record.notice_id))?;

        if outcome.created {
            created_snapshots += 1;
        } else {
            unchanged_listings += 1;
        }
        outcomes.push(ScanOutcome {
            notice_id: record.notice_id.clone(),
            solicitation_number: record.solicitation_number.clone(),
            created: outcome.created,
            snapshot_id: outcome.snapshot.id,
            content_hash: outcome.snapshot.content_hash,
        });
    }

    let summary = ScanSummary {
        started_at,
        finished_at: Utc::now(),
        fetched_records: records.len(),
        skipped_records,
        created_snapshots,
        unchanged_listings,
        outcomes,
    };
    info!(
        fetched = summary.fetched_records,
        created = summary.created_snapshots,
        unchanged = summary.unchanged_listings,
        skipped = summary.skipped_records,
        "scan complete"
    );
    Ok(summary)
}

async fn must_get(
    repo: &dyn SnapshotRepo,
    notice_id: &str,
    snapshot_id: Uuid,
) -> Result<Snapshot, StoreError> {
    repo.get(notice_id, snapshot_id)
        .await?
        .ok_or(StoreError::SnapshotNotFound {
            notice_id: notice_id.to_string(),
            snapshot_id,
        })
}

/// Resolve the snapshot pair for a diff query: explicit ids when given,
/// otherwise the two most recent snapshots for the listing.
pub async fn diff_listing(
    repo: &dyn SnapshotRepo,
    notice_id: &str,
    from_id: Option<Uuid>,
    to_id: Option<Uuid>,
) -> Result<ListingDiff, StoreError> {
    let (from, to) = if let (Some(from_id), Some(to_id)) = (from_id, to_id) {
        (
            must_get(repo, notice_id, from_id).await?,
            must_get(repo, notice_id, to_id).await?,
        )
    } else {
        let (default_from, default_to) = repo.latest_pair(notice_id).await?;
        let from = match from_id {
            Some(id) => must_get(repo, notice_id, id).await?,
            None => default_from,
        };
        let to = match to_id {
            Some(id) => must_get(repo, notice_id, id).await?,
            None => default_to,
        };
        (from, to)
    };
    Ok(diff_snapshots(&from, &to))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpactRequest {
    pub sections: Vec<ProposalSection>,
    #[serde(default)]
    pub linked_requirements: BTreeMap<String, String>,
    #[serde(default)]
    pub from_snapshot_id: Option<Uuid>,
    #[serde(default)]
    pub to_snapshot_id: Option<Uuid>,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
}

fn default_top_n() -> usize {
    10
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingImpact {
    pub notice_id: String,
    pub from_snapshot_id: Uuid,
    pub to_snapshot_id: Uuid,
    #[serde(flatten)]
    pub report: ImpactReport,
}

/// Diff a listing's snapshot pair, then score the caller's sections.
pub async fn impact_listing(
    repo: &dyn SnapshotRepo,
    analyzer: &ImpactAnalyzer,
    notice_id: &str,
    request: &ImpactRequest,
) -> Result<ListingImpact, StoreError> {
    let top_n = request.top_n.clamp(1, 50);
    let diff = diff_listing(
        repo,
        notice_id,
        request.from_snapshot_id,
        request.to_snapshot_id,
    )
    .await?;
    let report = analyzer.analyze(
        &diff.changes,
        &request.sections,
        &request.linked_requirements,
        top_n,
    );
    Ok(ListingImpact {
        notice_id: notice_id.to_string(),
        from_snapshot_id: diff.from_snapshot_id,
        to_snapshot_id: diff.to_snapshot_id,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use amendwatch_feed::{FeedTransport, TransportError, TransportResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct StaticTransport {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FeedTransport for StaticTransport {
        async fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            let mut bodies = self.bodies.lock().unwrap();
            let body = if bodies.len() > 1 {
                bodies.remove(0)
            } else {
                bodies[0].clone()
            };
            Ok(TransportResponse {
                status: 200,
                retry_after: None,
                body,
            })
        }
    }

    fn feed_with(bodies: Vec<String>) -> FeedClient {
        let config = FeedConfig {
            api_key: Some("test-key".to_string()),
            ..FeedConfig::default()
        };
        FeedClient::with_transport(
            config,
            Arc::new(StaticTransport {
                bodies: Mutex::new(bodies),
            }),
        )
    }

    fn listing(deadline: &str) -> serde_json::Value {
        json!({
            "noticeId": "n-1",
            "solicitationNumber": "SOL-1",
            "postedDate": "2025-05-01",
            "responseDeadLine": deadline,
            "naicsCode": "541511"
        })
    }

    #[tokio::test]
    async fn rescanning_an_unchanged_feed_creates_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        let body = json!({"opportunitiesData": [listing("2025-06-01")]}).to_string();
        let feed = feed_with(vec![body]);

        let first = run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .expect("first scan");
        let second = run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .expect("second scan");

        assert_eq!(first.created_snapshots, 1);
        assert_eq!(second.created_snapshots, 0);
        assert_eq!(second.unchanged_listings, 1);
        assert_eq!(store.history("n-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scan_skips_malformed_records_and_keeps_typed_dates() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        let body = json!({"opportunitiesData": [
            listing("2025-06-01"),
            {"title": "record without a notice id"}
        ]})
        .to_string();
        let feed = feed_with(vec![body]);

        let summary = run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .expect("scan");

        // The id-less record is dropped at the feed layer already.
        assert_eq!(summary.fetched_records, 1);
        assert_eq!(summary.created_snapshots, 1);
        let snapshot = store.latest("n-1").await.unwrap().expect("snapshot");
        assert_eq!(
            snapshot.response_deadline,
            chrono::NaiveDate::from_ymd_opt(2025, 6, 1)
        );
    }

    #[tokio::test]
    async fn default_diff_uses_the_two_most_recent_snapshots() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        let bodies = vec![
            json!({"opportunitiesData": [listing("2025-06-01")]}).to_string(),
            json!({"opportunitiesData": [listing("2025-06-15")]}).to_string(),
        ];
        let feed = feed_with(bodies);
        run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .unwrap();
        run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .unwrap();

        let diff = diff_listing(&store, "n-1", None, None).await.expect("diff");
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].field, "response_deadline");
        assert_eq!(diff.changes[0].to_value.as_deref(), Some("2025-06-15"));
    }

    #[tokio::test]
    async fn explicit_snapshot_ids_are_honored_and_validated() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        let bodies = vec![
            json!({"opportunitiesData": [listing("2025-06-01")]}).to_string(),
            json!({"opportunitiesData": [listing("2025-06-15")]}).to_string(),
        ];
        let feed = feed_with(bodies);
        let first = run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .unwrap();
        let second = run_scan(&store, &feed, &SearchParams::default(), None)
            .await
            .unwrap();

        let from_id = first.outcomes[0].snapshot_id;
        let to_id = second.outcomes[0].snapshot_id;
        let diff = diff_listing(&store, "n-1", Some(from_id), Some(to_id))
            .await
            .expect("explicit diff");
        assert_eq!(diff.from_snapshot_id, from_id);
        assert_eq!(diff.to_snapshot_id, to_id);

        let missing = diff_listing(&store, "n-1", Some(Uuid::new_v4()), Some(to_id)).await;
        assert!(matches!(
            missing,
            Err(StoreError::SnapshotNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn impact_requires_enough_history() {
        let dir = tempdir().expect("tempdir");
        let store = FsSnapshotStore::new(dir.path());
        let analyzer = ImpactAnalyzer::new(ImpactRules::default());
        let request = ImpactRequest {
            sections: vec![],
            linked_requirements: BTreeMap::new(),
            from_snapshot_id: None,
            to_snapshot_id: None,
            top_n: 10,
        };

        let result = impact_listing(&store, &analyzer, "unknown", &request).await;
        assert!(matches!(
            result,
            Err(StoreError::InsufficientSnapshots { have: 0, .. })
        ));
    }
}
