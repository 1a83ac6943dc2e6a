//! Core domain model, identity and shared vocabulary for GOF.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gof-core";

pub const MIN_KEYWORD_LEN: usize = 3;
pub const MAX_KEYWORD_LEN: usize = 48;

/// Organization record as served by the profile provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrgProfile {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub mission: Option<String>,
    #[serde(default)]
    pub focus_areas: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub subject_codes: Vec<String>,
    #[serde(default)]
    pub population_codes: Vec<String>,
}

/// Derived keyword/location/taxonomy signature for one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueryProfile {
    pub keywords: Vec<String>,
    pub locations: BTreeSet<String>,
    pub subject_codes: BTreeSet<String>,
    pub population_codes: BTreeSet<String>,
}

impl QueryProfile {
    /// Adds a keyword after lowercasing; rejects duplicates and out-of-range lengths.
    pub fn push_keyword(&mut self, raw: &str) -> bool {
        let keyword = collapse_whitespace_lower(raw);
        let len = keyword.chars().count();
        if !(MIN_KEYWORD_LEN..=MAX_KEYWORD_LEN).contains(&len) || self.keywords.contains(&keyword) {
            return false;
        }
        self.keywords.push(keyword);
        true
    }

    pub fn push_location(&mut self, raw: &str) {
        let location = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if !location.is_empty() {
            self.locations.insert(location);
        }
    }

    /// Too little signal to search with: no keywords and no subject codes.
    pub fn is_sparse(&self) -> bool {
        self.keywords.is_empty() && self.subject_codes.is_empty()
    }

    /// Stable textual rendering used for cache keys and source notes.
    pub fn query_params(&self) -> String {
        let mut parts = Vec::new();
        if !self.keywords.is_empty() {
            let mut keywords = self.keywords.clone();
            keywords.sort();
            parts.push(format!("kw={}", keywords.join(",")));
        }
        if !self.locations.is_empty() {
            let locations = self
                .locations
                .iter()
                .map(|l| l.to_lowercase())
                .collect::<Vec<_>>();
            parts.push(format!("loc={}", locations.join(",")));
        }
        if !self.subject_codes.is_empty() {
            parts.push(format!(
                "subj={}",
                self.subject_codes.iter().cloned().collect::<Vec<_>>().join(",")
            ));
        }
        if !self.population_codes.is_empty() {
            parts.push(format!(
                "pop={}",
                self.population_codes.iter().cloned().collect::<Vec<_>>().join(",")
            ));
        }
        parts.join(";")
    }
}

/// Source-native record, only valid inside one connector response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawOpportunity {
    pub title: String,
    pub funder: String,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub posted: Option<String>,
    pub deadline: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub geography: Option<String>,
    pub eligibility: Option<String>,
    #[serde(default)]
    pub subject_codes: Vec<String>,
}

/// Audit trail describing where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceNotes {
    pub api: String,
    pub query: String,
    pub window: String,
}

/// Canonical opportunity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub org_id: Option<Uuid>,
    pub stable_key: String,
    pub title: String,
    pub funder: String,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub deadline: Option<NaiveDate>,
    pub posted_date: Option<NaiveDate>,
    pub geography: Option<String>,
    pub eligibility_text: Option<String>,
    pub description: Option<String>,
    pub subject_codes: BTreeSet<String>,
    pub source_name: String,
    pub source_url: Option<String>,
    pub source_notes: SourceNotes,
    pub discovered_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub latest_score: Option<u8>,
}

impl Opportunity {
    /// Midpoint when both bounds are known, otherwise whichever bound exists.
    pub fn award_amount(&self) -> Option<f64> {
        match (self.amount_min, self.amount_max) {
            (Some(min), Some(max)) => Some((min + max) / 2.0),
            (Some(v), None) | (None, Some(v)) => Some(v),
            (None, None) => None,
        }
    }

    /// Lowercased text the scorer searches for keywords and subject terms.
    pub fn searchable_text(&self) -> String {
        let mut text = self.title.to_lowercase();
        for extra in [&self.description, &self.eligibility_text] {
            if let Some(extra) = extra {
                text.push(' ');
                text.push_str(&extra.to_lowercase());
            }
        }
        text
    }

    /// Whether title or funder differ from `other` beyond casing/whitespace.
    pub fn identity_differs(&self, other: &Opportunity) -> bool {
        collapse_whitespace_lower(&self.title) != collapse_whitespace_lower(&other.title)
            || collapse_whitespace_lower(&self.funder) != collapse_whitespace_lower(&other.funder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScoreResult {
    pub score: u8,
    pub reasons: Vec<String>,
    pub flags: BTreeSet<String>,
}

/// Opportunity as returned to callers, with its explanation attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredOpportunity {
    pub opportunity: Opportunity,
    pub score: u8,
    pub reasons: Vec<String>,
    pub flags: BTreeSet<String>,
    pub source_notes: SourceNotes,
}

impl ScoredOpportunity {
    pub fn new(opportunity: Opportunity, result: ScoreResult) -> Self {
        let source_notes = opportunity.source_notes.clone();
        Self {
            opportunity,
            score: result.score,
            reasons: result.reasons,
            flags: result.flags,
            source_notes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiscoveryStats {
    pub discovered: usize,
    pub created: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub persistence_failures: usize,
    pub persistence_failed: bool,
    pub fallback_used: bool,
    pub sources_attempted: Vec<String>,
    pub sources_cached: Vec<String>,
    pub sources_failed: Vec<String>,
}

impl DiscoveryStats {
    pub fn mark_failed(&mut self, source: &str) {
        if !self.sources_failed.iter().any(|s| s == source) {
            self.sources_failed.push(source.to_string());
        }
    }

    pub fn all_sources_failed(&self) -> bool {
        self.sources_attempted.is_empty()
            || self.sources_failed.len() >= self.sources_attempted.len()
    }
}

/// Discovery run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    TokenResolved,
    Fetching,
    Normalizing,
    Persisting,
    Scoring,
    Done,
    Degraded,
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, TokenResolved)
                | (TokenResolved, Fetching)
                | (Fetching, Normalizing)
                | (Fetching, Degraded)
                | (Normalizing, Persisting)
                | (Persisting, Scoring)
                | (Persisting, Degraded)
                | (Degraded, Scoring)
                | (Scoring, Done)
                | (Scoring, Degraded)
                | (Fetching, Failed)
                | (Degraded, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Degraded | RunState::Failed)
    }
}

pub fn collapse_whitespace_lower(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Deterministic identity hash over title, funder and URL (or deadline).
pub fn stable_key(
    title: &str,
    funder: &str,
    source_url: Option<&str>,
    deadline: Option<NaiveDate>,
) -> String {
    let locator = match source_url.map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => collapse_whitespace_lower(url),
        None => deadline.map(|d| d.to_string()).unwrap_or_default(),
    };
    let mut hasher = Sha256::new();
    hasher.update(collapse_whitespace_lower(title).as_bytes());
    hasher.update(b"|");
    hasher.update(collapse_whitespace_lower(funder).as_bytes());
    hasher.update(b"|");
    hasher.update(locator.as_bytes());
    hex::encode(hasher.finalize())
}

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%Y%m%d"];

const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parses the date shapes seen across sources. Unknown shapes yield `None`.
pub fn parse_loose_date(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    NAIVE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Whole-word containment of an already-lowercased `term` in lowercased `haystack`.
pub fn contains_term(haystack: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(term) {
        let begin = start + pos;
        let end = begin + term.len();
        let before_ok = haystack[..begin]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        start = begin + term.len().max(1);
        if start >= haystack.len() {
            break;
        }
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub code: String,
    pub terms: Vec<String>,
}

/// Fixed term to taxonomy-code table (NTEE major groups).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectVocabulary {
    pub entries: Vec<VocabularyEntry>,
}

impl Default for SubjectVocabulary {
    fn default() -> Self {
        let table: &[(&str, &[&str])] = &[
            ("A", &["arts", "culture", "humanities", "museum", "music", "theater"]),
            ("B", &["education", "school", "literacy", "scholarship", "students", "tutoring"]),
            ("C", &["environment", "conservation", "climate", "sustainability"]),
            ("D", &["animal", "animals", "wildlife"]),
            ("E", &["health", "healthcare", "medical", "clinic"]),
            ("F", &["mental health", "substance abuse", "addiction"]),
            ("I", &["justice", "legal aid", "crime prevention", "reentry"]),
            ("J", &["employment", "workforce", "job training"]),
            ("K", &["food", "hunger", "nutrition", "agriculture"]),
            ("L", &["housing", "shelter", "homelessness"]),
            ("M", &["disaster", "emergency", "public safety"]),
            ("N", &["recreation", "sports", "athletics"]),
            ("O", &["youth", "mentoring", "after-school", "children"]),
            ("P", &["human services", "families", "seniors", "social services"]),
            ("Q", &["international", "global development", "foreign affairs"]),
            ("R", &["civil rights", "advocacy", "equity"]),
            ("S", &["community", "economic development", "neighborhood"]),
            ("U", &["science", "research", "stem", "technology"]),
            ("W", &["public policy", "veterans", "civic"]),
            ("X", &["religion", "faith", "church"]),
        ];
        Self {
            entries: table
                .iter()
                .map(|(code, terms)| VocabularyEntry {
                    code: (*code).to_string(),
                    terms: terms.iter().map(|t| (*t).to_string()).collect(),
                })
                .collect(),
        }
    }
}

impl SubjectVocabulary {
    /// Taxonomy codes whose terms occur as whole words in `text`.
    pub fn codes_for(&self, text: &str) -> BTreeSet<String> {
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .filter(|entry| entry.terms.iter().any(|t| contains_term(&lower, &t.to_lowercase())))
            .map(|entry| entry.code.clone())
            .collect()
    }

    /// Vocabulary terms occurring in `text`, in table order.
    pub fn terms_in(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        let mut out = Vec::new();
        for entry in &self.entries {
            for term in &entry.terms {
                let term = term.to_lowercase();
                if contains_term(&lower, &term) && !out.contains(&term) {
                    out.push(term);
                }
            }
        }
        out
    }
}
