//! Core domain model for the amendwatch pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "amendwatch-core";

/// Procurement notice type, mapped from the upstream one-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfpType {
    Solicitation,
    Presolicitation,
    CombinedSynopsis,
    SourcesSought,
    SpecialNotice,
    Award,
    SaleOfSurplus,
    IntentToBundle,
}

impl RfpType {
    /// Unknown codes fall back to `Solicitation`.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "p" => Self::Presolicitation,
            "k" => Self::CombinedSynopsis,
            "r" => Self::SourcesSought,
            "s" => Self::SpecialNotice,
            "a" => Self::Award,
            "g" => Self::SaleOfSurplus,
            "i" => Self::IntentToBundle,
            _ => Self::Solicitation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Solicitation => "solicitation",
            Self::Presolicitation => "presolicitation",
            Self::CombinedSynopsis => "combined_synopsis",
            Self::SourcesSought => "sources_sought",
            Self::SpecialNotice => "special_notice",
            Self::Award => "award",
            Self::SaleOfSurplus => "sale_of_surplus",
            Self::IntentToBundle => "intent_to_bundle",
        }
    }
}

/// Opaque upstream listing payload, keyed before any typed parsing.
///
/// Immutable once fetched; the snapshot store hashes `payload` verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListingRecord {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub payload: JsonValue,
}

/// Typed projection of one raw upstream listing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub agency: String,
    pub sub_agency: String,
    pub rfp_type: RfpType,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub description: Option<String>,
    pub resource_links: Vec<String>,
}

/// Stored, hashed copy of a listing's raw payload at a point in time.
///
/// Snapshots for one `notice_id` form an append-only log ordered by
/// `fetched_at`; a row is written only when `content_hash` differs from the
/// latest existing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub linked_opportunity_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,
    pub fetched_at: DateTime<Utc>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    pub content_hash: String,
    pub raw_payload: JsonValue,
}

impl Snapshot {
    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            id: self.id,
            notice_id: self.notice_id.clone(),
            solicitation_number: self.solicitation_number.clone(),
            fetched_at: self.fetched_at,
            posted_date: self.posted_date,
            response_deadline: self.response_deadline,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// History projection without the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: Uuid,
    pub notice_id: String,
    pub solicitation_number: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub posted_date: Option<NaiveDate>,
    pub response_deadline: Option<NaiveDate>,
    pub content_hash: String,
}

/// Fixed comparable projection of a raw payload, the diff input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub response_deadline: Option<String>,
    pub posted_date: Option<String>,
    pub naics_code: Option<String>,
    pub set_aside: Option<String>,
    pub rfp_type: Option<String>,
    pub resource_links_count: Option<u64>,
    pub resource_links_hash: Option<String>,
    pub description_hash: Option<String>,
    pub description_length: Option<u64>,
}

impl FieldSummary {
    /// Stable field order consumed by the differ and downstream ranking.
    pub const FIELD_ORDER: [&'static str; 9] = [
        "response_deadline",
        "posted_date",
        "naics_code",
        "set_aside",
        "rfp_type",
        "resource_links_count",
        "resource_links_hash",
        "description_hash",
        "description_length",
    ];

    /// Canonical string rendering of one summary field.
    pub fn value_of(&self, field: &str) -> Option<String> {
        match field {
            "response_deadline" => self.response_deadline.clone(),
            "posted_date" => self.posted_date.clone(),
            "naics_code" => self.naics_code.clone(),
            "set_aside" => self.set_aside.clone(),
            "rfp_type" => self.rfp_type.clone(),
            "resource_links_count" => self.resource_links_count.map(|v| v.to_string()),
            "resource_links_hash" => self.resource_links_hash.clone(),
            "description_hash" => self.description_hash.clone(),
            "description_length" => self.description_length.map(|v| v.to_string()),
            _ => None,
        }
    }
}

/// One differing field between two summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from_value: Option<String>,
    pub to_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactArea {
    Timeline,
    Eligibility,
    Scope,
    Attachments,
}

impl ImpactArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeline => "timeline",
            Self::Eligibility => "eligibility",
            Self::Scope => "scope",
            Self::Attachments => "attachments",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
}

impl ImpactLevel {
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Read-only proposal section record supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalSection {
    pub proposal_id: Uuid,
    pub section_id: Uuid,
    pub section_number: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub requirement_id: Option<String>,
}

/// Ranked recommendation that a section be revisited after an amendment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRemediation {
    pub proposal_id: Uuid,
    pub section_id: Uuid,
    pub section_number: String,
    pub section_title: String,
    pub section_status: String,
    pub impact_score: u32,
    pub impact_level: ImpactLevel,
    pub matched_change_fields: Vec<String>,
    pub rationale: String,
    pub recommended_actions: Vec<String>,
    pub approval_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfp_type_codes_map_with_solicitation_fallback() {
        assert_eq!(RfpType::from_code("p"), RfpType::Presolicitation);
        assert_eq!(RfpType::from_code("K"), RfpType::CombinedSynopsis);
        assert_eq!(RfpType::from_code("r"), RfpType::SourcesSought);
        assert_eq!(RfpType::from_code("o"), RfpType::Solicitation);
        assert_eq!(RfpType::from_code("zz"), RfpType::Solicitation);
        assert_eq!(RfpType::from_code(""), RfpType::Solicitation);
    }

    #[test]
    fn severity_ordinals_are_ordered() {
        assert!(Severity::Low.ordinal() < Severity::Medium.ordinal());
        assert!(Severity::Medium.ordinal() < Severity::High.ordinal());
    }

    #[test]
    fn summary_value_of_covers_every_ordered_field() {
        let summary = FieldSummary {
            response_deadline: Some("2025-06-01".into()),
            posted_date: Some("2025-05-01".into()),
            naics_code: Some("541511".into()),
            set_aside: Some("SBA".into()),
            rfp_type: Some("solicitation".into()),
            resource_links_count: Some(2),
            resource_links_hash: Some("abc".into()),
            description_hash: Some("def".into()),
            description_length: Some(140),
        };
        for field in FieldSummary::FIELD_ORDER {
            assert!(summary.value_of(field).is_some(), "missing {field}");
        }
        assert_eq!(summary.value_of("resource_links_count").as_deref(), Some("2"));
        assert_eq!(summary.value_of("unknown_field"), None);
    }
}
