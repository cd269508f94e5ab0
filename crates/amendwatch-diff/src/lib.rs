//! Field-summary projection and ordered structural diff of snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use amendwatch_core::{FieldChange, FieldSummary, RfpType, Snapshot};
use amendwatch_store::{canonical_json, sha256_hex};

pub const CRATE_NAME: &str = "amendwatch-diff";

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

/// Project a raw payload onto the fixed comparable field set.
///
/// List-valued fields keep both a count and an order-sensitive content
/// hash, so additions, removals, and reorderings all register even when
/// the count is unchanged. Free text keeps a hash and a length instead of
/// the text itself.
pub fn summarize(raw: &JsonValue) -> FieldSummary {
    let links = raw.get("resourceLinks").and_then(JsonValue::as_array);
    let description = raw.get("description").and_then(JsonValue::as_str);

    FieldSummary {
        response_deadline: raw.get("responseDeadLine").and_then(scalar_string),
        posted_date: raw.get("postedDate").and_then(scalar_string),
        naics_code: raw.get("naicsCode").and_then(scalar_string),
        set_aside: raw.get("typeOfSetAside").and_then(scalar_string),
        rfp_type: raw
            .get("type")
            .and_then(JsonValue::as_str)
            .map(|code| RfpType::from_code(code).as_str().to_string()),
        resource_links_count: links.map(|l| l.len() as u64),
        resource_links_hash: links
            .map(|l| sha256_hex(canonical_json(&JsonValue::Array(l.clone())).as_bytes())),
        description_hash: description.map(|d| sha256_hex(d.as_bytes())),
        description_length: description.map(|d| d.chars().count() as u64),
    }
}

/// Ordered field-level changes between two summaries.
///
/// Walks `FieldSummary::FIELD_ORDER`, emitting a change for every field
/// whose value differs, `null → value` and `value → null` included.
/// Fields absent from both summaries are skipped. The output order is the
/// order consumed downstream, so results are reproducible for a given
/// snapshot pair.
pub fn diff(from: &FieldSummary, to: &FieldSummary) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for field in FieldSummary::FIELD_ORDER {
        let from_value = from.value_of(field);
        let to_value = to.value_of(field);
        if from_value.is_none() && to_value.is_none() {
            continue;
        }
        if from_value != to_value {
            changes.push(FieldChange {
                field: field.to_string(),
                from_value,
                to_value,
            });
        }
    }
    changes
}

/// Diff result for one snapshot pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingDiff {
    pub from_snapshot_id: Uuid,
    pub to_snapshot_id: Uuid,
    pub changes: Vec<FieldChange>,
    pub summary_from: FieldSummary,
    pub summary_to: FieldSummary,
}

pub fn diff_snapshots(from: &Snapshot, to: &Snapshot) -> ListingDiff {
    let summary_from = summarize(&from.raw_payload);
    let summary_to = summarize(&to.raw_payload);
    let changes = diff(&summary_from, &summary_to);
    ListingDiff {
        from_snapshot_id: from.id,
        to_snapshot_id: to.id,
        changes,
        summary_from,
        summary_to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_a() -> JsonValue {
        json!({
            "responseDeadLine": "2025-06-01",
            "postedDate": "2025-05-01",
            "naicsCode": "541511",
            "typeOfSetAside": "SBA",
            "type": "o",
            "resourceLinks": ["https://x.gov/a.pdf", "https://x.gov/b.pdf"],
            "description": "Provide cloud support services.",
            "extraneousField": "ignored by the summary"
        })
    }

    #[test]
    fn summaries_ignore_extraneous_payload_fields() {
        let with_extra = summarize(&payload_a());
        let mut trimmed = payload_a();
        trimmed.as_object_mut().unwrap().remove("extraneousField");
        let without_extra = summarize(&trimmed);

        assert_eq!(with_extra, without_extra);
        assert!(diff(&with_extra, &without_extra).is_empty());
    }

    #[test]
    fn summarize_projects_the_fixed_field_set() {
        let summary = summarize(&payload_a());
        assert_eq!(summary.response_deadline.as_deref(), Some("2025-06-01"));
        assert_eq!(summary.rfp_type.as_deref(), Some("solicitation"));
        assert_eq!(summary.resource_links_count, Some(2));
        assert!(summary.resource_links_hash.is_some());
        assert_eq!(
            summary.description_length,
            Some("Provide cloud support services.".chars().count() as u64)
        );
    }

    #[test]
    fn deadline_change_yields_exactly_one_field_change() {
        let from = summarize(&payload_a());
        let mut payload_b = payload_a();
        payload_b["responseDeadLine"] = json!("2025-06-15");
        let to = summarize(&payload_b);

        let changes = diff(&from, &to);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "response_deadline");
        assert_eq!(changes[0].from_value.as_deref(), Some("2025-06-01"));
        assert_eq!(changes[0].to_value.as_deref(), Some("2025-06-15"));
    }

    #[test]
    fn diff_is_deterministic_and_symmetric() {
        let from = summarize(&payload_a());
        let mut payload_b = payload_a();
        payload_b["responseDeadLine"] = json!("2025-06-15");
        payload_b["naicsCode"] = json!("541512");
        let to = summarize(&payload_b);

        let forward = diff(&from, &to);
        assert_eq!(forward, diff(&from, &to));

        let backward = diff(&to, &from);
        assert_eq!(forward.len(), backward.len());
        for (f, b) in forward.iter().zip(backward.iter()) {
            assert_eq!(f.field, b.field);
            assert_eq!(f.from_value, b.to_value);
            assert_eq!(f.to_value, b.from_value);
        }
    }

    #[test]
    fn null_transitions_are_reported_and_absent_fields_skipped() {
        let from = summarize(&json!({"responseDeadLine": "2025-06-01"}));
        let to = summarize(&json!({"typeOfSetAside": "SBA"}));

        let changes = diff(&from, &to);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, "response_deadline");
        assert_eq!(changes[0].to_value, None);
        assert_eq!(changes[1].field, "set_aside");
        assert_eq!(changes[1].from_value, None);
    }

    #[test]
    fn reordered_resource_links_register_as_a_hash_change() {
        let from = summarize(&payload_a());
        let mut payload_b = payload_a();
        payload_b["resourceLinks"] = json!(["https://x.gov/b.pdf", "https://x.gov/a.pdf"]);
        let to = summarize(&payload_b);

        let changes = diff(&from, &to);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "resource_links_hash");
        assert_eq!(from.resource_links_count, to.resource_links_count);
    }

    #[test]
    fn changes_follow_the_fixed_field_order() {
        let mut payload_b = payload_a();
        payload_b["responseDeadLine"] = json!("2025-06-15");
        payload_b["description"] = json!("Provide cloud support services, now expanded.");
        payload_b["naicsCode"] = json!("541512");
        let changes = diff(&summarize(&payload_a()), &summarize(&payload_b));

        let fields: Vec<&str> = changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "response_deadline",
                "naics_code",
                "description_hash",
                "description_length"
            ]
        );
    }
}
