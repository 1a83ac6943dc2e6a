//! Explainable 0-100 relevance scoring and ranking.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gof_core::{contains_term, Opportunity, OrgProfile, QueryProfile, ScoreResult, ScoredOpportunity};
use serde::{Deserialize, Serialize};

pub const FLAG_ABOVE_TYPICAL: &str = "above typical range";
pub const FLAG_DEADLINE_WEEK: &str = "Deadline within 7 days";
pub const FLAG_DEADLINE_TWO_WEEKS: &str = "Deadline within 2 weeks";
pub const FLAG_DEADLINE_PASSED: &str = "Deadline passed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencyBucket {
    pub max_days: i64,
    pub points: u8,
}

/// Factor weights and thresholds. Overridable through `rules/scoring.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub taxonomy_hit: u8,
    pub keyword_per_match: u8,
    pub keyword_cap: u8,
    pub geography_exact: u8,
    pub geography_region: u8,
    pub eligibility_strong: u8,
    pub eligibility_generic: u8,
    pub strong_eligibility_terms: Vec<String>,
    pub generic_eligibility_terms: Vec<String>,
    pub amount_in_range: u8,
    pub amount_below: u8,
    pub amount_above: u8,
    pub ratio_low: f64,
    pub ratio_high: f64,
    pub recency: Vec<RecencyBucket>,
    pub deadline_urgent_days: i64,
    pub deadline_soon_days: i64,
    pub max_score: u8,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            taxonomy_hit: 40,
            keyword_per_match: 15,
            keyword_cap: 40,
            geography_exact: 20,
            geography_region: 10,
            eligibility_strong: 15,
            eligibility_generic: 8,
            strong_eligibility_terms: ["nonprofit", "non-profit", "501(c)(3)", "charitable", "tax-exempt"]
                .map(String::from)
                .to_vec(),
            generic_eligibility_terms: vec!["organization".to_string()],
            amount_in_range: 15,
            amount_below: 8,
            amount_above: 5,
            ratio_low: 0.5,
            ratio_high: 2.0,
            recency: vec![
                RecencyBucket { max_days: 7, points: 10 },
                RecencyBucket { max_days: 30, points: 7 },
                RecencyBucket { max_days: 45, points: 4 },
            ],
            deadline_urgent_days: 7,
            deadline_soon_days: 14,
            max_score: 100,
        }
    }
}

/// Typical award size the amount factor compares against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub median_award: Option<f64>,
    pub as_of: DateTime<Utc>,
}

impl MarketSnapshot {
    pub fn new(median_award: Option<f64>, as_of: DateTime<Utc>) -> Self {
        Self { median_award, as_of }
    }

    /// Median of the known award amounts; `None` when no opportunity states one.
    pub fn from_opportunities<'a>(
        opportunities: impl IntoIterator<Item = &'a Opportunity>,
        as_of: DateTime<Utc>,
    ) -> Self {
        let mut amounts = opportunities
            .into_iter()
            .filter_map(Opportunity::award_amount)
            .filter(|a| *a > 0.0)
            .collect::<Vec<_>>();
        amounts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let median_award = match amounts.len() {
            0 => None,
            n if n % 2 == 1 => Some(amounts[n / 2]),
            n => Some((amounts[n / 2 - 1] + amounts[n / 2]) / 2.0),
        };
        Self { median_award, as_of }
    }
}

/// Per-factor points before the total cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FactorScores {
    pub subject: u8,
    pub geography: u8,
    pub eligibility: u8,
    pub amount: u8,
    pub recency: u8,
}

impl FactorScores {
    pub fn sum(&self) -> u32 {
        [self.subject, self.geography, self.eligibility, self.amount, self.recency]
            .iter()
            .map(|p| u32::from(*p))
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    policy: ScoringPolicy,
}

impl ScoringEngine {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn score(
        &self,
        opportunity: &Opportunity,
        profile: &QueryProfile,
        market: &MarketSnapshot,
    ) -> ScoreResult {
        self.score_with_factors(opportunity, profile, market).0
    }

    pub fn score_with_factors(
        &self,
        opportunity: &Opportunity,
        profile: &QueryProfile,
        market: &MarketSnapshot,
    ) -> (ScoreResult, FactorScores) {
        let p = &self.policy;
        let today = market.as_of.date_naive();
        let mut reasons = Vec::new();
        let mut flags = BTreeSet::new();
        let mut factors = FactorScores::default();

        let shared_codes = profile
            .subject_codes
            .intersection(&opportunity.subject_codes)
            .cloned()
            .collect::<Vec<_>>();
        if !shared_codes.is_empty() {
            factors.subject = p.taxonomy_hit.min(p.keyword_cap);
            reasons.push(format!(
                "Matches organization focus areas ({})",
                shared_codes.join(", ")
            ));
        } else {
            let text = opportunity.searchable_text();
            let matched = profile
                .keywords
                .iter()
                .filter(|kw| contains_term(&text, kw))
                .cloned()
                .collect::<Vec<_>>();
            if !matched.is_empty() {
                let points = u32::from(p.keyword_per_match) * matched.len() as u32;
                factors.subject = points.min(u32::from(p.keyword_cap)) as u8;
                reasons.push(format!("Mentions keywords: {}", matched.join(", ")));
            }
        }

        if let Some((points, reason)) = self.geography(opportunity, profile) {
            factors.geography = points;
            reasons.push(reason);
        }

        if let Some(eligibility) = opportunity.eligibility_text.as_deref() {
            let lower = eligibility.to_lowercase();
            if p.strong_eligibility_terms.iter().any(|t| lower.contains(&t.to_lowercase())) {
                factors.eligibility = p.eligibility_strong;
                reasons.push("Eligible for nonprofits".to_string());
            } else if p.generic_eligibility_terms.iter().any(|t| lower.contains(&t.to_lowercase())) {
                factors.eligibility = p.eligibility_generic;
                reasons.push("Open to organizations".to_string());
            }
        }

        if let (Some(amount), Some(median)) = (
            opportunity.award_amount(),
            market.median_award.filter(|m| *m > 0.0),
        ) {
            let ratio = amount / median;
            if ratio < p.ratio_low {
                factors.amount = p.amount_below;
                reasons.push(format!("Award {} is below typical {}", dollars(amount), dollars(median)));
            } else if ratio > p.ratio_high {
                factors.amount = p.amount_above;
                flags.insert(FLAG_ABOVE_TYPICAL.to_string());
                reasons.push(format!("Award {} is above typical {}", dollars(amount), dollars(median)));
            } else {
                factors.amount = p.amount_in_range;
                reasons.push(format!(
                    "Award {} is in line with typical {}",
                    dollars(amount),
                    dollars(median)
                ));
            }
        }

        if let Some(posted) = opportunity.posted_date {
            let age = (today - posted).num_days().max(0);
            if let Some(bucket) = p.recency.iter().find(|b| age <= b.max_days) {
                factors.recency = bucket.points;
                reasons.push(match age {
                    0 => "Posted today".to_string(),
                    1 => "Posted 1 day ago".to_string(),
                    n => format!("Posted {n} days ago"),
                });
            }
        }

        if let Some(flag) = self.deadline_flag(opportunity.deadline, today) {
            flags.insert(flag.to_string());
        }

        let score = factors.sum().min(u32::from(p.max_score)) as u8;
        (ScoreResult { score, reasons, flags }, factors)
    }

    fn geography(&self, opportunity: &Opportunity, profile: &QueryProfile) -> Option<(u8, String)> {
        let haystack = opportunity
            .geography
            .as_deref()
            .or(opportunity.description.as_deref())?
            .to_lowercase();

        let exact = profile
            .locations
            .iter()
            .filter(|l| l.chars().count() > 2)
            .find(|l| haystack.contains(&l.to_lowercase()));
        if let Some(location) = exact {
            return Some((self.policy.geography_exact, format!("Serves {location}")));
        }

        profile
            .locations
            .iter()
            .filter(|l| l.chars().count() == 2)
            .find(|code| contains_term(&haystack, &code.to_lowercase()))
            .map(|code| {
                (
                    self.policy.geography_region,
                    format!("Located in region {}", code.to_uppercase()),
                )
            })
    }

    fn deadline_flag(&self, deadline: Option<NaiveDate>, today: NaiveDate) -> Option<&'static str> {
        let days_left = (deadline? - today).num_days();
        if days_left < 0 {
            Some(FLAG_DEADLINE_PASSED)
        } else if days_left <= self.policy.deadline_urgent_days {
            Some(FLAG_DEADLINE_WEEK)
        } else if days_left <= self.policy.deadline_soon_days {
            Some(FLAG_DEADLINE_TWO_WEEKS)
        } else {
            None
        }
    }
}

/// Higher score first; equal scores by newer posted date, undated last; then title.
pub fn rank(items: &mut [ScoredOpportunity]) {
    items.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| match (a.opportunity.posted_date, b.opportunity.posted_date) {
                (Some(a), Some(b)) => b.cmp(&a),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.opportunity.title.cmp(&b.opportunity.title))
    });
}

fn dollars(amount: f64) -> String {
    let whole = amount.round() as u64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    format!("${out}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiAssessment {
    pub match_score: u8,
    pub rationale: String,
}

/// Optional model-backed scorer. Absence or failure only lowers ranking fidelity.
#[async_trait]
pub trait AiScorer: Send + Sync {
    async fn score(&self, organization: &OrgProfile, opportunity: &Opportunity) -> anyhow::Result<AiAssessment>;
}
