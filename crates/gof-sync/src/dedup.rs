//! In-batch duplicate collapse and per-run persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gof_core::Opportunity;
use gof_storage::{OpportunityStore, RunCommit, StoreError, UpsertOutcome};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct PersistOutcome {
    pub commit: RunCommit,
    /// Records dropped before persistence because another source reported the same opportunity.
    pub collapsed: usize,
}

impl PersistOutcome {
    pub fn created(&self) -> usize {
        self.commit.count(UpsertOutcome::Created)
    }

    pub fn updated(&self) -> usize {
        self.commit.count(UpsertOutcome::Updated)
    }

    pub fn duplicates(&self) -> usize {
        self.commit.count(UpsertOutcome::Duplicate) + self.collapsed
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.commit.records.iter().map(|r| r.opportunity.clone()).collect()
    }
}

pub struct Deduplicator {
    store: Arc<dyn OpportunityStore>,
    staleness: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn OpportunityStore>, staleness: Duration) -> Self {
        Self { store, staleness }
    }

    /// Keeps the first record per stable key, filling its empty fields from later copies.
    pub fn collapse(batch: Vec<Opportunity>) -> (Vec<Opportunity>, usize) {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut kept: Vec<Opportunity> = Vec::with_capacity(batch.len());
        let mut collapsed = 0usize;

        for item in batch {
            match index.get(&item.stable_key) {
                Some(&i) => {
                    let first = &mut kept[i];
                    if first.amount_min.is_none() && first.amount_max.is_none() {
                        first.amount_min = item.amount_min;
                        first.amount_max = item.amount_max;
                    }
                    first.posted_date = first.posted_date.or(item.posted_date);
                    first.geography = first.geography.take().or(item.geography);
                    first.eligibility_text = first.eligibility_text.take().or(item.eligibility_text);
                    first.description = first.description.take().or(item.description);
                    first.subject_codes.extend(item.subject_codes);
                    collapsed += 1;
                }
                None => {
                    index.insert(item.stable_key.clone(), kept.len());
                    kept.push(item);
                }
            }
        }
        (kept, collapsed)
    }

    /// Atomic per run: on error nothing from this batch is stored.
    pub async fn persist(
        &self,
        org_id: Uuid,
        batch: Vec<Opportunity>,
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome, StoreError> {
        let (batch, collapsed) = Self::collapse(batch);
        if collapsed > 0 {
            debug!(%org_id, collapsed, "collapsed in-batch duplicates");
        }
        let commit = self
            .store
            .commit_run(Some(org_id), batch, now, self.staleness)
            .await?;
        Ok(PersistOutcome { commit, collapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gof_core::{stable_key, SourceNotes};
    use gof_storage::{default_staleness, MemoryOpportunityStore};
    use std::collections::BTreeSet;

    fn item(title: &str, url: &str, source: &str) -> Opportunity {
        let now = Utc::now();
        Opportunity {
            id: Uuid::new_v4(),
            org_id: None,
            stable_key: stable_key(title, "City Foundation", Some(url), None),
            title: title.to_string(),
            funder: "City Foundation".into(),
            amount_min: None,
            amount_max: None,
            deadline: None,
            posted_date: None,
            geography: None,
            eligibility_text: None,
            description: None,
            subject_codes: BTreeSet::new(),
            source_name: source.into(),
            source_url: Some(url.into()),
            source_notes: SourceNotes::default(),
            discovered_at: now,
            last_updated_at: now,
            latest_score: None,
        }
    }

    #[test]
    fn collapse_merges_missing_fields_into_first_copy() {
        let first = item("Youth Grant", "https://x/1", "news-feed");
        let mut second = item("YOUTH grant", "https://x/1", "foundation-transactions");
        second.amount_max = Some(25_000.0);
        second.geography = Some("Chicago".into());
        let other = item("Arts Grant", "https://x/2", "news-feed");

        let (kept, collapsed) = Deduplicator::collapse(vec![first.clone(), second, other]);
        assert_eq!(collapsed, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, first.id);
        assert_eq!(kept[0].source_name, "news-feed");
        assert_eq!(kept[0].amount_max, Some(25_000.0));
        assert_eq!(kept[0].geography.as_deref(), Some("Chicago"));
    }

    #[test]
    fn collapse_never_mixes_amount_bounds_across_copies() {
        let mut first = item("Youth Grant", "https://x/1", "news-feed");
        first.amount_max = Some(10_000.0);
        let mut second = item("Youth Grant", "https://x/1", "foundation-transactions");
        second.amount_min = Some(50_000.0);

        let (kept, _) = Deduplicator::collapse(vec![first, second]);
        assert_eq!((kept[0].amount_min, kept[0].amount_max), (None, Some(10_000.0)));
    }

    #[tokio::test]
    async fn persist_counts_collapsed_records_as_duplicates() {
        let store = Arc::new(MemoryOpportunityStore::new());
        let dedup = Deduplicator::new(store.clone(), default_staleness());
        let org = Uuid::new_v4();
        let batch = vec![
            item("Youth Grant", "https://x/1", "news-feed"),
            item("Youth Grant", "https://x/1", "federal-registry"),
        ];
        let outcome = dedup.persist(org, batch, Utc::now()).await.unwrap();
        assert_eq!(outcome.created(), 1);
        assert_eq!(outcome.duplicates(), 1);
        assert_eq!(outcome.opportunities()[0].org_id, Some(org));
        assert_eq!(store.count_for_org(Some(org)).await.unwrap(), 1);
    }
}
