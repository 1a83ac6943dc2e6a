//! Durable opportunity store contract, upsert resolution and the in-memory backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gof_core::{collapse_whitespace_lower, Opportunity};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Records refreshed more recently than this are reported as duplicates.
pub const DEFAULT_STALENESS_HOURS: i64 = 24;

pub fn default_staleness() -> Duration {
    Duration::hours(DEFAULT_STALENESS_HOURS)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertDecision {
    Create,
    Update,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRecord {
    pub outcome: UpsertOutcome,
    pub opportunity: Opportunity,
}

/// Result of committing one discovery run.
#[derive(Debug, Clone, Default)]
pub struct RunCommit {
    pub records: Vec<UpsertRecord>,
    /// Records that still conflicted after the update-lookup retry.
    pub conflicts: usize,
}

impl RunCommit {
    pub fn count(&self, outcome: UpsertOutcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }
}

#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Upserts every opportunity of one run atomically: all or nothing.
    async fn commit_run(
        &self,
        org_id: Option<Uuid>,
        batch: Vec<Opportunity>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<RunCommit, StoreError>;

    /// Most recently refreshed opportunities for an organization, newest first.
    async fn recent_for_org(
        &self,
        org_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError>;

    /// Caches the latest display score. Not authoritative.
    async fn record_scores(&self, org_id: Uuid, scores: &[(Uuid, u8)]) -> Result<(), StoreError>;

    async fn count_for_org(&self, org_id: Option<Uuid>) -> Result<usize, StoreError>;
}

/// Decides create/update/duplicate for `incoming` against the matched record.
pub fn resolve_upsert(
    existing: Option<&Opportunity>,
    incoming: &Opportunity,
    now: DateTime<Utc>,
    staleness: Duration,
) -> UpsertDecision {
    let Some(existing) = existing else {
        return UpsertDecision::Create;
    };
    let amount_changed =
        existing.amount_min != incoming.amount_min || existing.amount_max != incoming.amount_max;
    let stale = now - existing.last_updated_at >= staleness;
    if existing.identity_differs(incoming) || amount_changed || stale {
        UpsertDecision::Update
    } else {
        UpsertDecision::Duplicate
    }
}

/// Applies `incoming` onto `existing`, keeping identity and known values the
/// new fetch no longer carries.
pub fn merge_update(existing: &Opportunity, incoming: Opportunity, now: DateTime<Utc>) -> Opportunity {
    // The bounds travel as a pair so min never ends up above max.
    let (amount_min, amount_max) = if incoming.amount_min.is_some() || incoming.amount_max.is_some() {
        (incoming.amount_min, incoming.amount_max)
    } else {
        (existing.amount_min, existing.amount_max)
    };
    Opportunity {
        id: existing.id,
        org_id: existing.org_id,
        discovered_at: existing.discovered_at,
        last_updated_at: now,
        latest_score: existing.latest_score,
        amount_min,
        amount_max,
        deadline: incoming.deadline.or(existing.deadline),
        posted_date: incoming.posted_date.or(existing.posted_date),
        geography: incoming.geography.or_else(|| existing.geography.clone()),
        eligibility_text: incoming
            .eligibility_text
            .or_else(|| existing.eligibility_text.clone()),
        description: incoming.description.or_else(|| existing.description.clone()),
        source_url: incoming.source_url.or_else(|| existing.source_url.clone()),
        ..incoming
    }
}

fn non_empty_url(opportunity: &Opportunity) -> Option<&str> {
    opportunity
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
}

/// Identity lookup: exact source URL first, then normalized (title, funder).
fn find_match<'a>(
    rows: impl Iterator<Item = &'a Opportunity> + Clone,
    org_id: Option<Uuid>,
    incoming: &Opportunity,
) -> Option<&'a Opportunity> {
    let scoped = rows.filter(move |row| row.org_id == org_id);
    if let Some(url) = non_empty_url(incoming) {
        if let Some(hit) = scoped
            .clone()
            .find(|row| non_empty_url(row) == Some(url))
        {
            return Some(hit);
        }
    }
    let title = collapse_whitespace_lower(&incoming.title);
    let funder = collapse_whitespace_lower(&incoming.funder);
    scoped.clone().find(|row| {
        collapse_whitespace_lower(&row.title) == title
            && collapse_whitespace_lower(&row.funder) == funder
    })
}

/// In-memory backend with the same semantics as the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryOpportunityStore {
    rows: Mutex<HashMap<Uuid, Opportunity>>,
}

impl MemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_raw(&self, opportunity: Opportunity) {
        self.rows.lock().await.insert(opportunity.id, opportunity);
    }

    pub async fn all(&self) -> Vec<Opportunity> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl OpportunityStore for MemoryOpportunityStore {
    async fn commit_run(
        &self,
        org_id: Option<Uuid>,
        batch: Vec<Opportunity>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<RunCommit, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut working = rows.clone();
        let mut commit = RunCommit::default();

        for mut incoming in batch {
            incoming.org_id = org_id;
            let existing = find_match(working.values(), org_id, &incoming).cloned();
            let record = match resolve_upsert(existing.as_ref(), &incoming, now, staleness) {
                UpsertDecision::Create => {
                    if working.contains_key(&incoming.id) {
                        incoming.id = Uuid::new_v4();
                    }
                    incoming.discovered_at = now;
                    incoming.last_updated_at = now;
                    working.insert(incoming.id, incoming.clone());
                    UpsertRecord {
                        outcome: UpsertOutcome::Created,
                        opportunity: incoming,
                    }
                }
                UpsertDecision::Update => {
                    let Some(existing) = existing else {
                        return Err(StoreError::Message("update without match".into()));
                    };
                    let merged = merge_update(&existing, incoming, now);
                    working.insert(merged.id, merged.clone());
                    UpsertRecord {
                        outcome: UpsertOutcome::Updated,
                        opportunity: merged,
                    }
                }
                UpsertDecision::Duplicate => UpsertRecord {
                    outcome: UpsertOutcome::Duplicate,
                    opportunity: existing.unwrap_or(incoming),
                },
            };
            commit.records.push(record);
        }

        *rows = working;
        Ok(commit)
    }

    async fn recent_for_org(
        &self,
        org_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let rows = self.rows.lock().await;
        let mut found = rows
            .values()
            .filter(|o| o.org_id == Some(org_id))
            .filter(|o| since.map_or(true, |since| o.last_updated_at >= since))
            .cloned()
            .collect::<Vec<_>>();
        found.sort_by(|a, b| b.last_updated_at.cmp(&a.last_updated_at));
        found.truncate(limit);
        Ok(found)
    }

    async fn record_scores(&self, org_id: Uuid, scores: &[(Uuid, u8)]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        for (id, score) in scores {
            if let Some(row) = rows.get_mut(id).filter(|r| r.org_id == Some(org_id)) {
                row.latest_score = Some(*score);
            }
        }
        Ok(())
    }

    async fn count_for_org(&self, org_id: Option<Uuid>) -> Result<usize, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|o| o.org_id == org_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gof_core::{stable_key, SourceNotes};
    use std::collections::BTreeSet;

    fn opportunity(title: &str, funder: &str, url: Option<&str>, amount: Option<f64>) -> Opportunity {
        let now = Utc::now();
        Opportunity {
            id: Uuid::new_v4(),
            org_id: None,
            stable_key: stable_key(title, funder, url, None),
            title: title.to_string(),
            funder: funder.to_string(),
            amount_min: amount,
            amount_max: amount,
            deadline: None,
            posted_date: None,
            geography: Some("Chicago".into()),
            eligibility_text: None,
            description: None,
            subject_codes: BTreeSet::new(),
            source_name: "news-feed".into(),
            source_url: url.map(ToString::to_string),
            source_notes: SourceNotes::default(),
            discovered_at: now,
            last_updated_at: now,
            latest_score: None,
        }
    }

    #[test]
    fn resolve_upsert_covers_create_update_duplicate() {
        let now = Utc::now();
        let incoming = opportunity("Youth Grant", "City Foundation", Some("https://x/1"), Some(10.0));
        assert_eq!(
            resolve_upsert(None, &incoming, now, default_staleness()),
            UpsertDecision::Create
        );

        let mut existing = incoming.clone();
        existing.last_updated_at = now - Duration::hours(1);
        assert_eq!(
            resolve_upsert(Some(&existing), &incoming, now, default_staleness()),
            UpsertDecision::Duplicate
        );

        existing.last_updated_at = now - Duration::hours(25);
        assert_eq!(
            resolve_upsert(Some(&existing), &incoming, now, default_staleness()),
            UpsertDecision::Update
        );

        existing.last_updated_at = now;
        existing.title = "Youth Grant (extended)".into();
        assert_eq!(
            resolve_upsert(Some(&existing), &incoming, now, default_staleness()),
            UpsertDecision::Update
        );
    }

    #[test]
    fn casing_changes_alone_are_not_material() {
        let now = Utc::now();
        let incoming = opportunity("youth  grant", "CITY FOUNDATION", None, None);
        let existing = opportunity("Youth Grant", "City Foundation", None, None);
        assert_eq!(
            resolve_upsert(Some(&existing), &incoming, now, default_staleness()),
            UpsertDecision::Duplicate
        );
    }

    #[tokio::test]
    async fn second_commit_reports_duplicates_and_creates_nothing() {
        let store = MemoryOpportunityStore::new();
        let org = Some(Uuid::new_v4());
        let now = Utc::now();
        let batch = vec![
            opportunity("Youth Grant", "City Foundation", Some("https://x/1"), Some(40000.0)),
            opportunity("Arts Grant", "Arts Council", None, None),
        ];

        let first = store
            .commit_run(org, batch.clone(), now, default_staleness())
            .await
            .unwrap();
        assert_eq!(first.count(UpsertOutcome::Created), 2);

        let rerun = batch
            .into_iter()
            .map(|mut o| {
                o.id = Uuid::new_v4();
                o
            })
            .collect::<Vec<_>>();
        let second = store
            .commit_run(org, rerun, now + Duration::minutes(5), default_staleness())
            .await
            .unwrap();
        assert_eq!(second.count(UpsertOutcome::Created), 0);
        assert_eq!(second.count(UpsertOutcome::Duplicate), 2);
        assert_eq!(store.count_for_org(org).await.unwrap(), 2);

        let first_ids = first.records.iter().map(|r| r.opportunity.id).collect::<BTreeSet<_>>();
        let second_ids = second.records.iter().map(|r| r.opportunity.id).collect::<BTreeSet<_>>();
        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn title_funder_lookup_matches_when_url_missing_and_scopes_by_org() {
        let store = MemoryOpportunityStore::new();
        let org_a = Some(Uuid::new_v4());
        let org_b = Some(Uuid::new_v4());
        let now = Utc::now();
        let item = opportunity("Food Access Grant", "Harvest Fund", None, Some(5000.0));

        store
            .commit_run(org_a, vec![item.clone()], now, default_staleness())
            .await
            .unwrap();
        let mut changed = item.clone();
        changed.id = Uuid::new_v4();
        changed.amount_max = Some(7500.0);
        let updated = store
            .commit_run(org_a, vec![changed], now, default_staleness())
            .await
            .unwrap();
        assert_eq!(updated.records[0].outcome, UpsertOutcome::Updated);
        assert_eq!(updated.records[0].opportunity.id, item.id);
        assert_eq!(updated.records[0].opportunity.amount_max, Some(7500.0));

        let other_org = store
            .commit_run(org_b, vec![item], now, default_staleness())
            .await
            .unwrap();
        assert_eq!(other_org.records[0].outcome, UpsertOutcome::Created);
    }

    #[test]
    fn merge_takes_the_newer_amount_pair_whole() {
        let now = Utc::now();
        let mut existing = opportunity("Youth Grant", "City Foundation", Some("https://x/1"), None);
        existing.amount_min = Some(100_000.0);
        existing.amount_max = Some(200_000.0);

        let mut incoming = existing.clone();
        incoming.amount_min = None;
        incoming.amount_max = Some(50_000.0);
        let merged = merge_update(&existing, incoming.clone(), now);
        assert_eq!((merged.amount_min, merged.amount_max), (None, Some(50_000.0)));

        incoming.amount_max = None;
        let merged = merge_update(&existing, incoming, now);
        assert_eq!((merged.amount_min, merged.amount_max), (Some(100_000.0), Some(200_000.0)));
    }

    #[tokio::test]
    async fn narrowed_amount_update_keeps_bounds_ordered() {
        let store = MemoryOpportunityStore::new();
        let org = Some(Uuid::new_v4());
        let now = Utc::now();
        let mut item = opportunity("Capital Grant", "Harvest Fund", Some("https://x/cap"), None);
        item.amount_min = Some(100_000.0);
        item.amount_max = Some(200_000.0);
        store
            .commit_run(org, vec![item.clone()], now, default_staleness())
            .await
            .unwrap();

        let mut revised = item.clone();
        revised.id = Uuid::new_v4();
        revised.amount_min = None;
        revised.amount_max = Some(50_000.0);
        let commit = store
            .commit_run(org, vec![revised], now, default_staleness())
            .await
            .unwrap();
        let stored = &commit.records[0];
        assert_eq!(stored.outcome, UpsertOutcome::Updated);
        assert_eq!(stored.opportunity.id, item.id);
        assert_eq!(stored.opportunity.amount_min, None);
        assert_eq!(stored.opportunity.amount_max, Some(50_000.0));
    }

    #[tokio::test]
    async fn recent_for_org_orders_newest_first_and_honors_since() {
        let store = MemoryOpportunityStore::new();
        let org = Uuid::new_v4();
        let now = Utc::now();
        for (i, hours) in [1i64, 30, 5].iter().enumerate() {
            let mut o = opportunity(&format!("Grant {i}"), "Funder", None, None);
            o.org_id = Some(org);
            o.last_updated_at = now - Duration::hours(*hours);
            store.insert_raw(o).await;
        }

        let recent = store
            .recent_for_org(org, Some(now - Duration::hours(24)), 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].title, "Grant 0");

        let best_available = store.recent_for_org(org, None, 10).await.unwrap();
        assert_eq!(best_available.len(), 3);
        assert_eq!(best_available[2].title, "Grant 1");
    }
}
