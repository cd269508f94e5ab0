//! Amendment impact analysis: impact profiles, lexical relevance scoring,
//! deterministic section ranking, and aggregate risk classification.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use amendwatch_core::{
    FieldChange, ImpactArea, ImpactLevel, ProposalSection, RiskLevel, SectionRemediation, Severity,
};

pub const CRATE_NAME: &str = "amendwatch-impact";

/// Business impact profile for one changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactProfile {
    pub impact_area: ImpactArea,
    pub severity: Severity,
    pub recommended_actions: Vec<String>,
}

/// A field change enriched with its impact profile. Ephemeral, computed
/// per analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmendmentImpactSignal {
    pub field: String,
    pub from_value: Option<String>,
    pub to_value: Option<String>,
    pub impact_area: ImpactArea,
    pub severity: Severity,
    pub recommended_actions: Vec<String>,
}

/// Scoring magnitudes. The defaults are behavior-compatibility constants
/// carried over from production tuning; override them via the rules file
/// rather than editing code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "d_overlap_points")]
    pub overlap_points_per_token: u32,
    #[serde(default = "d_overlap_cap")]
    pub overlap_cap: u32,
    #[serde(default = "d_timeline_bonus")]
    pub timeline_bonus: u32,
    #[serde(default = "d_eligibility_bonus")]
    pub eligibility_bonus: u32,
    #[serde(default = "d_scope_bonus")]
    pub scope_bonus: u32,
    #[serde(default = "d_attachments_bonus")]
    pub attachments_bonus: u32,
    #[serde(default = "d_requirement_bonus")]
    pub requirement_link_bonus: u32,
    #[serde(default = "d_inclusion_threshold")]
    pub inclusion_threshold: u32,
    #[serde(default = "d_medium_threshold")]
    pub medium_threshold: u32,
    #[serde(default = "d_high_threshold")]
    pub high_threshold: u32,
}

fn d_overlap_points() -> u32 {
    8
}
fn d_overlap_cap() -> u32 {
    32
}
fn d_timeline_bonus() -> u32 {
    20
}
fn d_eligibility_bonus() -> u32 {
    24
}
fn d_scope_bonus() -> u32 {
    18
}
fn d_attachments_bonus() -> u32 {
    18
}
fn d_requirement_bonus() -> u32 {
    12
}
fn d_inclusion_threshold() -> u32 {
    25
}
fn d_medium_threshold() -> u32 {
    40
}
fn d_high_threshold() -> u32 {
    70
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            overlap_points_per_token: d_overlap_points(),
            overlap_cap: d_overlap_cap(),
            timeline_bonus: d_timeline_bonus(),
            eligibility_bonus: d_eligibility_bonus(),
            scope_bonus: d_scope_bonus(),
            attachments_bonus: d_attachments_bonus(),
            requirement_link_bonus: d_requirement_bonus(),
            inclusion_threshold: d_inclusion_threshold(),
            medium_threshold: d_medium_threshold(),
            high_threshold: d_high_threshold(),
        }
    }
}

/// Domain keyword sets for the per-area heuristic bonuses, matched as
/// lowercase substrings of the section text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordSets {
    #[serde(default = "d_timeline_keywords")]
    pub timeline: Vec<String>,
    #[serde(default = "d_eligibility_keywords")]
    pub eligibility: Vec<String>,
    #[serde(default = "d_technical_keywords")]
    pub technical: Vec<String>,
    #[serde(default = "d_reference_keywords")]
    pub reference: Vec<String>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn d_timeline_keywords() -> Vec<String> {
    strings(&["schedule", "milestone", "phase", "transition", "delivery"])
}

fn d_eligibility_keywords() -> Vec<String> {
    strings(&[
        "naics",
        "set-aside",
        "set aside",
        "small business",
        "8(a)",
        "hubzone",
        "wosb",
        "sdvosb",
        "vehicle",
    ])
}

fn d_technical_keywords() -> Vec<String> {
    strings(&["approach", "requirement", "compliance", "performance", "task"])
}

fn d_reference_keywords() -> Vec<String> {
    strings(&["attachment", "appendix", "evidence", "document"])
}

impl Default for KeywordSets {
    fn default() -> Self {
        Self {
            timeline: d_timeline_keywords(),
            eligibility: d_eligibility_keywords(),
            technical: d_technical_keywords(),
            reference: d_reference_keywords(),
        }
    }
}

/// The full tunable rule set: per-field profiles, keyword sets, weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpactRules {
    pub profiles: BTreeMap<String, ImpactProfile>,
    pub fallback: ImpactProfile,
    pub keywords: KeywordSets,
    pub weights: ScoreWeights,
}

fn profile(area: ImpactArea, severity: Severity, actions: &[&str]) -> ImpactProfile {
    ImpactProfile {
        impact_area: area,
        severity,
        recommended_actions: strings(actions),
    }
}

impl Default for ImpactRules {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "response_deadline".to_string(),
            profile(
                ImpactArea::Timeline,
                Severity::High,
                &[
                    "Reassess the delivery schedule against the new deadline",
                    "Update milestone dates in the management volume",
                ],
            ),
        );
        profiles.insert(
            "posted_date".to_string(),
            profile(
                ImpactArea::Timeline,
                Severity::Low,
                &["Confirm the amendment posting date on the opportunity record"],
            ),
        );
        profiles.insert(
            "naics_code".to_string(),
            profile(
                ImpactArea::Eligibility,
                Severity::High,
                &[
                    "Re-verify size-standard eligibility under the new NAICS code",
                    "Review teaming partner eligibility",
                ],
            ),
        );
        profiles.insert(
            "set_aside".to_string(),
            profile(
                ImpactArea::Eligibility,
                Severity::High,
                &["Confirm set-aside eligibility for the prime and all partners"],
            ),
        );
        profiles.insert(
            "rfp_type".to_string(),
            profile(
                ImpactArea::Scope,
                Severity::Medium,
                &["Review submission requirements for the new notice type"],
            ),
        );
        profiles.insert(
            "resource_links_count".to_string(),
            profile(
                ImpactArea::Attachments,
                Severity::Medium,
                &["Download newly posted attachments and review for changes"],
            ),
        );
        profiles.insert(
            "resource_links_hash".to_string(),
            profile(
                ImpactArea::Attachments,
                Severity::Medium,
                &["Re-review posted attachments; content or ordering changed"],
            ),
        );
        profiles.insert(
            "description_hash".to_string(),
            profile(
                ImpactArea::Scope,
                Severity::High,
                &["Re-read the amended description and map changes onto drafted sections"],
            ),
        );
        profiles.insert(
            "description_length".to_string(),
            profile(
                ImpactArea::Scope,
                Severity::Low,
                &["Check the description for added or removed requirement text"],
            ),
        );

        Self {
            profiles,
            fallback: profile(
                ImpactArea::Scope,
                Severity::Low,
                &["Review the changed field against the affected sections"],
            ),
            keywords: KeywordSets::default(),
            weights: ScoreWeights::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    profiles: Vec<ProfileRule>,
    #[serde(default)]
    fallback: Option<ImpactProfile>,
    #[serde(default)]
    keywords: Option<KeywordSets>,
    #[serde(default)]
    weights: Option<ScoreWeights>,
}

#[derive(Debug, Deserialize)]
struct ProfileRule {
    field: String,
    impact_area: ImpactArea,
    severity: Severity,
    #[serde(default)]
    recommended_actions: Vec<String>,
}

impl ImpactRules {
    /// Load tuned rules from a versioned YAML file, layered over the
    /// compiled defaults so a partial file stays valid.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut rules = Self::default();
        for rule in file.profiles {
            rules.profiles.insert(
                rule.field,
                ImpactProfile {
                    impact_area: rule.impact_area,
                    severity: rule.severity,
                    recommended_actions: rule.recommended_actions,
                },
            );
        }
        if let Some(fallback) = file.fallback {
            rules.fallback = fallback;
        }
        if let Some(keywords) = file.keywords {
            rules.keywords = keywords;
        }
        if let Some(weights) = file.weights {
            rules.weights = weights;
        }
        Ok(rules)
    }
}

/// Lowercase alphanumeric runs of length >= 3.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            if current.chars().count() >= 3 {
                tokens.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.chars().count() >= 3 {
        tokens.insert(current);
    }
    tokens
}

fn contains_any(text: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|needle| text.contains(&needle.to_lowercase()))
}

/// Full analysis output for one change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpactReport {
    pub amendment_risk_level: RiskLevel,
    pub changed_fields: Vec<String>,
    pub signals: Vec<AmendmentImpactSignal>,
    pub impacted_sections: Vec<SectionRemediation>,
    pub sections_evaluated: usize,
    pub sections_impacted: usize,
    pub approval_workflow: Vec<String>,
}

/// Static human approval guidance attached to every report.
pub fn approval_workflow() -> Vec<String> {
    strings(&[
        "Route the amendment summary to the proposal manager for review",
        "Assign remediation of impacted sections to their owners",
        "Obtain compliance sign-off before resubmission",
    ])
}

pub struct ImpactAnalyzer {
    rules: ImpactRules,
}

impl ImpactAnalyzer {
    pub fn new(rules: ImpactRules) -> Self {
        Self { rules }
    }

    pub fn profile_for(&self, field: &str) -> &ImpactProfile {
        self.rules.profiles.get(field).unwrap_or(&self.rules.fallback)
    }

    pub fn signals(&self, changes: &[FieldChange]) -> Vec<AmendmentImpactSignal> {
        changes
            .iter()
            .map(|change| {
                let profile = self.profile_for(&change.field);
                AmendmentImpactSignal {
                    field: change.field.clone(),
                    from_value: change.from_value.clone(),
                    to_value: change.to_value.clone(),
                    impact_area: profile.impact_area,
                    severity: profile.severity,
                    recommended_actions: profile.recommended_actions.clone(),
                }
            })
            .collect()
    }

    fn area_bonus(&self, area: ImpactArea) -> u32 {
        match area {
            ImpactArea::Timeline => self.rules.weights.timeline_bonus,
            ImpactArea::Eligibility => self.rules.weights.eligibility_bonus,
            ImpactArea::Scope => self.rules.weights.scope_bonus,
            ImpactArea::Attachments => self.rules.weights.attachments_bonus,
        }
    }

    fn area_keywords(&self, area: ImpactArea) -> &[String] {
        match area {
            ImpactArea::Timeline => &self.rules.keywords.timeline,
            ImpactArea::Eligibility => &self.rules.keywords.eligibility,
            ImpactArea::Scope => &self.rules.keywords.technical,
            ImpactArea::Attachments => &self.rules.keywords.reference,
        }
    }

    /// Score and rank the sections affected by a change set.
    ///
    /// Pure and synchronous; safe to run in parallel across proposals.
    pub fn analyze(
        &self,
        changes: &[FieldChange],
        sections: &[ProposalSection],
        linked_requirements: &BTreeMap<String, String>,
        top_n: usize,
    ) -> ImpactReport {
        let weights = &self.rules.weights;
        let signals = self.signals(changes);
        let signal_tokens: Vec<BTreeSet<String>> =
            signals.iter().map(signal_token_set).collect();
        let change_vocabulary: BTreeSet<String> = signal_tokens
            .iter()
            .flat_map(|tokens| tokens.iter().cloned())
            .collect();

        let mut survivors = Vec::new();
        for section in sections {
            let requirement_text = section
                .requirement_id
                .as_deref()
                .and_then(|id| linked_requirements.get(id));

            let mut combined = format!(
                "{} {} {}",
                section.title, section.section_number, section.content
            );
            if let Some(id) = section.requirement_id.as_deref() {
                combined.push(' ');
                combined.push_str(id);
            }
            if let Some(text) = requirement_text {
                combined.push(' ');
                combined.push_str(text);
            }
            let section_tokens = tokenize(&combined);
            let lower_text = combined.to_lowercase();

            let mut score = 0u32;
            let mut matched_fields = Vec::new();
            let mut actions: Vec<String> = Vec::new();
            let mut rationale = Vec::new();

            for (signal, tokens) in signals.iter().zip(signal_tokens.iter()) {
                let overlap: Vec<&String> =
                    tokens.intersection(&section_tokens).collect();
                let mut contributed = false;

                if !overlap.is_empty() {
                    score += (overlap.len() as u32 * weights.overlap_points_per_token)
                        .min(weights.overlap_cap);
                    contributed = true;
                }

                if contains_any(&lower_text, self.area_keywords(signal.impact_area)) {
                    score += self.area_bonus(signal.impact_area);
                    contributed = true;
                }

                if contributed {
                    matched_fields.push(signal.field.clone());
                    for action in &signal.recommended_actions {
                        if !actions.contains(action) {
                            actions.push(action.clone());
                        }
                    }
                    if overlap.is_empty() {
                        rationale.push(format!("{}: semantic alignment", signal.field));
                    } else {
                        let top: Vec<&str> =
                            overlap.iter().take(3).map(|t| t.as_str()).collect();
                        rationale.push(format!("{}: overlaps {}", signal.field, top.join(", ")));
                    }
                }
            }

            if let Some(text) = requirement_text {
                if tokenize(text)
                    .intersection(&change_vocabulary)
                    .next()
                    .is_some()
                {
                    score += weights.requirement_link_bonus;
                    rationale.push("linked requirement shares amendment vocabulary".to_string());
                }
            }

            let score = score.min(100);
            if score < weights.inclusion_threshold {
                continue;
            }

            let impact_level = if score >= weights.high_threshold {
                ImpactLevel::High
            } else if score >= weights.medium_threshold {
                ImpactLevel::Medium
            } else {
                ImpactLevel::Low
            };

            survivors.push(SectionRemediation {
                proposal_id: section.proposal_id,
                section_id: section.section_id,
                section_number: section.section_number.clone(),
                section_title: section.title.clone(),
                section_status: section.status.clone(),
                impact_score: score,
                impact_level,
                matched_change_fields: matched_fields,
                rationale: rationale.join("; "),
                recommended_actions: actions,
                approval_required: impact_level != ImpactLevel::Low,
            });
        }

        survivors.sort_by(|a, b| {
            b.impact_score
                .cmp(&a.impact_score)
                .then(b.impact_level.ordinal().cmp(&a.impact_level.ordinal()))
                .then(a.proposal_id.cmp(&b.proposal_id))
                .then(a.section_id.cmp(&b.section_id))
        });

        let max_severity = signals
            .iter()
            .map(|s| s.severity.ordinal())
            .max()
            .unwrap_or(0);
        let max_section_score = survivors.first().map(|r| r.impact_score).unwrap_or(0);
        let amendment_risk_level = if max_severity >= 3 && max_section_score >= weights.high_threshold
        {
            RiskLevel::High
        } else if max_severity >= 2
            || max_section_score >= weights.medium_threshold
            || changes.len() >= 3
        {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        let sections_impacted = survivors.len();
        let mut impacted_sections = survivors;
        impacted_sections.truncate(top_n);

        ImpactReport {
            amendment_risk_level,
            changed_fields: changes.iter().map(|c| c.field.clone()).collect(),
            signals,
            impacted_sections,
            sections_evaluated: sections.len(),
            sections_impacted,
            approval_workflow: approval_workflow(),
        }
    }
}

fn signal_token_set(signal: &AmendmentImpactSignal) -> BTreeSet<String> {
    let mut text = signal.field.replace('_', " ");
    if let Some(value) = &signal.from_value {
        text.push(' ');
        text.push_str(value);
    }
    if let Some(value) = &signal.to_value {
        text.push(' ');
        text.push_str(value);
    }
    tokenize(&text)
}
