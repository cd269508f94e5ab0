//! Upstream opportunity-feed client: query building, typed retry, parsing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

use amendwatch_core::{Opportunity, RawListingRecord, RfpType};

pub const CRATE_NAME: &str = "amendwatch-feed";

/// Explicit retry policy consumed by the fetch loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
    /// Honored `Retry-After` wait is capped here to bound task latency.
    pub max_rate_limit_wait: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sam.gov/opportunities/v2/search".to_string(),
            api_key: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            retry: RetryPolicy::default(),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("AMENDWATCH_FEED_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("AMENDWATCH_FEED_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            timeout: std::env::var("AMENDWATCH_FEED_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: std::env::var("AMENDWATCH_USER_AGENT").ok(),
            retry: defaults.retry,
            max_rate_limit_wait: defaults.max_rate_limit_wait,
        }
    }
}

/// Upstream search request, translated into feed query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default)]
    pub naics_codes: Vec<String>,
    #[serde(default)]
    pub set_asides: Vec<String>,
    #[serde(default)]
    pub rfp_type_codes: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_sort")]
    pub sort: String,
}

fn default_days_back() -> u32 {
    1
}

fn default_limit() -> u32 {
    100
}

fn default_sort() -> String {
    "-modifiedDate".to_string()
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            keyword: None,
            days_back: default_days_back(),
            naics_codes: Vec::new(),
            set_asides: Vec::new(),
            rfp_type_codes: Vec::new(),
            limit: default_limit(),
            sort: default_sort(),
        }
    }
}

impl SearchParams {
    /// The reference date is a parameter so query construction is
    /// deterministic under test.
    pub fn query_pairs(&self, api_key: &str, today: NaiveDate) -> Vec<(String, String)> {
        let from = today
            .checked_sub_days(chrono::Days::new(u64::from(self.days_back)))
            .unwrap_or(today);
        let mut pairs = vec![
            ("api_key".to_string(), api_key.to_string()),
            ("postedFrom".to_string(), from.format("%m/%d/%Y").to_string()),
            ("postedTo".to_string(), today.format("%m/%d/%Y").to_string()),
            ("limit".to_string(), self.limit.to_string()),
            ("sort".to_string(), self.sort.clone()),
        ];
        if let Some(keyword) = self.keyword.as_deref().filter(|k| !k.trim().is_empty()) {
            pairs.push(("keywords".to_string(), keyword.trim().to_string()));
        }
        if !self.rfp_type_codes.is_empty() {
            pairs.push(("ptype".to_string(), self.rfp_type_codes.join(",")));
        }
        if !self.naics_codes.is_empty() {
            pairs.push(("ncode".to_string(), self.naics_codes.join(",")));
        }
        if !self.set_asides.is_empty() {
            pairs.push(("typeOfSetAside".to_string(), self.set_asides.join(",")));
        }
        pairs
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_))
    }
}

/// Seam between the retry loop and the wire, so tests can script
/// 429/5xx/timeout sequences.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() || err.is_request() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl FeedTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<TransportResponse, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed api key is not configured")]
    MissingCredentials,
    #[error("upstream status {status_code}: {body}")]
    Upstream {
        status_code: u16,
        body: String,
        retryable: bool,
    },
    #[error("rate limited by upstream; waited {waited:?}")]
    RateLimited { waited: Duration },
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: TransportError,
    },
    #[error("malformed feed response: {detail}")]
    Malformed { detail: String },
}

impl FeedError {
    pub fn retryable(&self) -> bool {
        match self {
            Self::MissingCredentials | Self::Malformed { .. } => false,
            Self::Upstream { retryable, .. } => *retryable,
            Self::RateLimited { .. } => true,
            Self::Transport { source } => source.retryable(),
        }
    }
}

/// Wait derived from a `Retry-After` header value: integer seconds or an
/// HTTP date, absent or unparseable defaults to 60s, always capped.
pub fn retry_after_wait(header: Option<&str>, cap: Duration) -> Duration {
    const DEFAULT_WAIT: Duration = Duration::from_secs(60);
    let wait = match header.map(str::trim) {
        Some(value) if !value.is_empty() => {
            if let Ok(secs) = value.parse::<u64>() {
                Duration::from_secs(secs)
            } else if let Ok(when) = DateTime::parse_from_rfc2822(value) {
                let until = when.with_timezone(&Utc) - Utc::now();
                until.to_std().unwrap_or(Duration::ZERO)
            } else {
                DEFAULT_WAIT
            }
        }
        _ => DEFAULT_WAIT,
    };
    wait.min(cap)
}

pub struct FeedClient {
    config: FeedConfig,
    transport: Arc<dyn FeedTransport>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.timeout,
            config.user_agent.as_deref(),
        )?);
        Ok(Self { config, transport })
    }

    pub fn with_transport(config: FeedConfig, transport: Arc<dyn FeedTransport>) -> Self {
        Self { config, transport }
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Fetch one page of raw listing records.
    ///
    /// Missing credentials fail immediately; transient failures (timeout,
    /// 5xx, 429) are retried per the policy, with the capped `Retry-After`
    /// wait standing in for the backoff delay on a 429 transition.
    pub async fn fetch(&self, params: &SearchParams) -> Result<Vec<RawListingRecord>, FeedError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(FeedError::MissingCredentials)?;
        let query = params.query_pairs(api_key, Utc::now().date_naive());

        let span = info_span!(
            "feed_fetch",
            days_back = params.days_back,
            limit = params.limit
        );
        async {
            let mut attempt = 0usize;
            loop {
                match self.attempt(&query).await {
                    Ok(records) => return Ok(records),
                    Err(err) if err.retryable() && attempt + 1 < self.config.retry.max_attempts => {
                        if !matches!(err, FeedError::RateLimited { .. }) {
                            tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                        }
                        warn!(attempt, error = %err, "retrying feed fetch");
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, query: &[(String, String)]) -> Result<Vec<RawListingRecord>, FeedError> {
        let resp = self.transport.get(&self.config.base_url, query).await?;
        match resp.status {
            200..=299 => parse_listing_body(&resp.body),
            429 => {
                let waited =
                    retry_after_wait(resp.retry_after.as_deref(), self.config.max_rate_limit_wait);
                tokio::time::sleep(waited).await;
                Err(FeedError::RateLimited { waited })
            }
            status @ 500..=599 => Err(FeedError::Upstream {
                status_code: status,
                body: resp.body,
                retryable: true,
            }),
            status => Err(FeedError::Upstream {
                status_code: status,
                body: resp.body,
                retryable: false,
            }),
        }
    }
}

fn parse_listing_body(body: &str) -> Result<Vec<RawListingRecord>, FeedError> {
    let value: JsonValue = serde_json::from_str(body).map_err(|e| FeedError::Malformed {
        detail: format!("response is not JSON: {e}"),
    })?;
    let entries = value
        .get("opportunitiesData")
        .and_then(JsonValue::as_array)
        .or_else(|| value.as_array())
        .ok_or_else(|| FeedError::Malformed {
            detail: "missing opportunitiesData array".to_string(),
        })?;

    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(notice_id) = entry.get("noticeId").and_then(scalar_string) else {
            warn!("skipping feed record without noticeId");
            continue;
        };
        records.push(RawListingRecord {
            notice_id,
            solicitation_number: entry.get("solicitationNumber").and_then(scalar_string),
            payload: entry.clone(),
        });
    }
    Ok(records)
}

#[derive(Debug, Error)]
pub enum RecordParseError {
    #[error("record is missing {0}")]
    MissingField(&'static str),
}

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// Ordered-format date parsing: first success wins, otherwise `None`.
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

fn scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn hierarchy_level(payload: &JsonValue, level: usize) -> Option<String> {
    let entry = payload
        .get("organizationHierarchy")
        .and_then(JsonValue::as_array)?
        .get(level)?;
    match entry {
        JsonValue::String(_) => scalar_string(entry),
        JsonValue::Object(_) => entry.get("name").and_then(scalar_string),
        _ => None,
    }
}

/// Parse one raw record into the typed opportunity model.
pub fn parse_opportunity(record: &RawListingRecord) -> Result<Opportunity, RecordParseError> {
    if record.notice_id.trim().is_empty() {
        return Err(RecordParseError::MissingField("notice_id"));
    }
    let payload = &record.payload;
    let date_of = |key: &str| {
        payload
            .get(key)
            .and_then(JsonValue::as_str)
            .and_then(parse_feed_date)
    };

    Ok(Opportunity {
        notice_id: record.notice_id.clone(),
        solicitation_number: record.solicitation_number.clone(),
        title: payload.get("title").and_then(scalar_string),
        agency: hierarchy_level(payload, 0).unwrap_or_else(|| "Unknown".to_string()),
        sub_agency: hierarchy_level(payload, 1).unwrap_or_else(|| "Unknown".to_string()),
        rfp_type: payload
            .get("type")
            .and_then(JsonValue::as_str)
            .map(RfpType::from_code)
            .unwrap_or(RfpType::Solicitation),
        posted_date: date_of("postedDate"),
        response_deadline: date_of("responseDeadLine"),
        naics_code: payload.get("naicsCode").and_then(scalar_string),
        set_aside: payload.get("typeOfSetAside").and_then(scalar_string),
        description: payload.get("description").and_then(scalar_string),
        resource_links: payload
            .get("resourceLinks")
            .and_then(JsonValue::as_array)
            .map(|links| links.iter().filter_map(scalar_string).collect())
            .unwrap_or_default(),
    })
}

/// Batch parse with per-record failure tolerance: a malformed record is
/// logged and skipped, never aborting the batch.
pub fn parse_records(records: &[RawListingRecord]) -> Vec<Opportunity> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        match parse_opportunity(record) {
            Ok(opportunity) => out.push(opportunity),
            Err(err) => {
                warn!(notice_id = %record.notice_id, error = %err, "skipping malformed feed record");
            }
        }
    }
    out
}
