//! Axum JSON API over the snapshot log, differ, and impact analyzer.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

use amendwatch_feed::{FeedClient, FeedError, SearchParams};
use amendwatch_impact::ImpactAnalyzer;
use amendwatch_pipeline::{diff_listing, impact_listing, run_scan, ImpactRequest};
use amendwatch_store::{SnapshotRepo, StoreError};

pub const CRATE_NAME: &str = "amendwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn SnapshotRepo>,
    pub analyzer: Arc<ImpactAnalyzer>,
    pub feed: Option<Arc<FeedClient>>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn SnapshotRepo>,
        analyzer: Arc<ImpactAnalyzer>,
        feed: Option<Arc<FeedClient>>,
    ) -> Self {
        Self {
            repo,
            analyzer,
            feed,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/scan", post(scan_handler))
        .route("/listings/{notice_id}/snapshots", get(snapshots_handler))
        .route("/listings/{notice_id}/diff", get(diff_handler))
        .route("/listings/{notice_id}/impact", post(impact_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "serving amendwatch api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match &err {
        StoreError::InsufficientSnapshots { have: 0, notice_id } => error_response(
            StatusCode::NOT_FOUND,
            format!("unknown listing {notice_id}"),
        ),
        StoreError::InsufficientSnapshots { .. } | StoreError::SnapshotNotFound { .. } => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SearchParams>,
) -> Response {
    let Some(feed) = &state.feed else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "feed credentials are not configured",
        );
    };

    match run_scan(state.repo.as_ref(), feed, &params, None).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            let status = match err.downcast_ref::<FeedError>() {
                Some(FeedError::MissingCredentials) => StatusCode::SERVICE_UNAVAILABLE,
                Some(_) => StatusCode::BAD_GATEWAY,
                None => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, format!("{err:#}"))
        }
    }
}

async fn snapshots_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(notice_id): AxumPath<String>,
) -> Response {
    match state.repo.history(&notice_id).await {
        Ok(history) if history.is_empty() => error_response(
            StatusCode::NOT_FOUND,
            format!("unknown listing {notice_id}"),
        ),
        Ok(history) => {
            let snapshots: Vec<_> = history.iter().map(|s| s.meta()).collect();
            Json(serde_json::json!({
                "notice_id": notice_id,
                "snapshots": snapshots,
            }))
            .into_response()
        }
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct DiffQuery {
    from: Option<Uuid>,
    to: Option<Uuid>,
}

async fn diff_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(notice_id): AxumPath<String>,
    Query(query): Query<DiffQuery>,
) -> Response {
    match diff_listing(state.repo.as_ref(), &notice_id, query.from, query.to).await {
        Ok(diff) => Json(diff).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn impact_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(notice_id): AxumPath<String>,
    Json(request): Json<ImpactRequest>,
) -> Response {
    match impact_listing(state.repo.as_ref(), &state.analyzer, &notice_id, &request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => store_error_response(err),
    }
}
