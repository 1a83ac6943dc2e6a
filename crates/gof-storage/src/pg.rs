//! Postgres-backed opportunity store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use gof_core::{collapse_whitespace_lower, Opportunity, SourceNotes};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::{
    merge_update, resolve_upsert, OpportunityStore, RunCommit, StoreError, UpsertDecision,
    UpsertOutcome, UpsertRecord,
};

const COLUMNS: &str = "id, org_id, stable_key, title, funder, amount_min, amount_max, deadline, \
     posted_date, geography, eligibility_text, description, subject_codes, source_name, \
     source_url, source_notes, discovered_at, last_updated_at, latest_score";

#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("opportunity store migrations applied");
        Ok(())
    }
}

/// Transaction-scoped advisory lock key for an organization scope.
fn advisory_key(org_id: Option<Uuid>) -> i64 {
    let bytes = org_id.unwrap_or_default().into_bytes();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(head)
}

fn row_to_opportunity(row: &PgRow) -> Result<Opportunity, sqlx::Error> {
    let subject_codes: Vec<String> = row.try_get("subject_codes")?;
    let source_notes: Json<SourceNotes> = row.try_get("source_notes")?;
    let latest_score: Option<i16> = row.try_get("latest_score")?;
    Ok(Opportunity {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        stable_key: row.try_get("stable_key")?,
        title: row.try_get("title")?,
        funder: row.try_get("funder")?,
        amount_min: row.try_get("amount_min")?,
        amount_max: row.try_get("amount_max")?,
        deadline: row.try_get("deadline")?,
        posted_date: row.try_get("posted_date")?,
        geography: row.try_get("geography")?,
        eligibility_text: row.try_get("eligibility_text")?,
        description: row.try_get("description")?,
        subject_codes: subject_codes.into_iter().collect(),
        source_name: row.try_get("source_name")?,
        source_url: row.try_get("source_url")?,
        source_notes: source_notes.0,
        discovered_at: row.try_get("discovered_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
        latest_score: latest_score.and_then(|s| u8::try_from(s).ok()),
    })
}

async fn find_existing(
    conn: &mut PgConnection,
    org_id: Option<Uuid>,
    incoming: &Opportunity,
) -> Result<Option<Opportunity>, sqlx::Error> {
    if let Some(url) = incoming
        .source_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
    {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM opportunities \
             WHERE org_id IS NOT DISTINCT FROM $1 AND source_url = $2 LIMIT 1"
        ))
        .bind(org_id)
        .bind(url)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = row {
            return row_to_opportunity(&row).map(Some);
        }
    }

    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM opportunities \
         WHERE org_id IS NOT DISTINCT FROM $1 AND title_norm = $2 AND funder_norm = $3 \
         ORDER BY last_updated_at DESC LIMIT 1"
    ))
    .bind(org_id)
    .bind(collapse_whitespace_lower(&incoming.title))
    .bind(collapse_whitespace_lower(&incoming.funder))
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_opportunity).transpose()
}

/// Returns false when a unique constraint swallowed the insert.
async fn insert(conn: &mut PgConnection, o: &Opportunity) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO opportunities (
            id, org_id, stable_key, title, funder, title_norm, funder_norm, amount_min,
            amount_max, deadline, posted_date, geography, eligibility_text, description,
            subject_codes, source_name, source_url, source_notes, discovered_at,
            last_updated_at, latest_score
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        ON CONFLICT DO NOTHING
        RETURNING id
        "#,
    )
    .bind(o.id)
    .bind(o.org_id)
    .bind(&o.stable_key)
    .bind(&o.title)
    .bind(&o.funder)
    .bind(collapse_whitespace_lower(&o.title))
    .bind(collapse_whitespace_lower(&o.funder))
    .bind(o.amount_min)
    .bind(o.amount_max)
    .bind(o.deadline)
    .bind(o.posted_date)
    .bind(&o.geography)
    .bind(&o.eligibility_text)
    .bind(&o.description)
    .bind(o.subject_codes.iter().cloned().collect::<Vec<_>>())
    .bind(&o.source_name)
    .bind(&o.source_url)
    .bind(Json(&o.source_notes))
    .bind(o.discovered_at)
    .bind(o.last_updated_at)
    .bind(o.latest_score.map(i16::from))
    .fetch_optional(&mut *conn)
    .await?;
    Ok(inserted.is_some())
}

async fn update(conn: &mut PgConnection, o: &Opportunity) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE opportunities SET
            stable_key = $2, title = $3, funder = $4, title_norm = $5, funder_norm = $6,
            amount_min = $7, amount_max = $8, deadline = $9, posted_date = $10,
            geography = $11, eligibility_text = $12, description = $13,
            subject_codes = $14, source_name = $15, source_url = $16, source_notes = $17,
            last_updated_at = $18
        WHERE id = $1
        "#,
    )
    .bind(o.id)
    .bind(&o.stable_key)
    .bind(&o.title)
    .bind(&o.funder)
    .bind(collapse_whitespace_lower(&o.title))
    .bind(collapse_whitespace_lower(&o.funder))
    .bind(o.amount_min)
    .bind(o.amount_max)
    .bind(o.deadline)
    .bind(o.posted_date)
    .bind(&o.geography)
    .bind(&o.eligibility_text)
    .bind(&o.description)
    .bind(o.subject_codes.iter().cloned().collect::<Vec<_>>())
    .bind(&o.source_name)
    .bind(&o.source_url)
    .bind(Json(&o.source_notes))
    .bind(o.last_updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn commit_run(
        &self,
        org_id: Option<Uuid>,
        batch: Vec<Opportunity>,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<RunCommit, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(org_id))
            .execute(&mut *tx)
            .await?;

        let mut commit = RunCommit::default();
        for mut incoming in batch {
            incoming.org_id = org_id;
            let existing = find_existing(&mut tx, org_id, &incoming).await?;
            let record = match resolve_upsert(existing.as_ref(), &incoming, now, staleness) {
                UpsertDecision::Create => {
                    incoming.discovered_at = now;
                    incoming.last_updated_at = now;
                    if insert(&mut tx, &incoming).await? {
                        UpsertRecord {
                            outcome: UpsertOutcome::Created,
                            opportunity: incoming,
                        }
                    } else {
                        // Lost a race on the unique index: retry once as an update.
                        match find_existing(&mut tx, org_id, &incoming).await? {
                            Some(existing) => {
                                let merged = merge_update(&existing, incoming, now);
                                update(&mut tx, &merged).await?;
                                UpsertRecord {
                                    outcome: UpsertOutcome::Updated,
                                    opportunity: merged,
                                }
                            }
                            None => {
                                warn!(
                                    title = incoming.title.as_str(),
                                    source = incoming.source_name.as_str(),
                                    "conflict persisted after update retry; skipping record"
                                );
                                commit.conflicts += 1;
                                continue;
                            }
                        }
                    }
                }
                UpsertDecision::Update => {
                    let Some(existing) = existing else {
                        return Err(StoreError::Message("update without match".into()));
                    };
                    let merged = merge_update(&existing, incoming, now);
                    update(&mut tx, &merged).await?;
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

        tx.commit().await?;
        Ok(commit)
    }

    async fn recent_for_org(
        &self,
        org_id: Uuid,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Opportunity>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM opportunities \
             WHERE org_id = $1 AND ($2::timestamptz IS NULL OR last_updated_at >= $2) \
             ORDER BY last_updated_at DESC LIMIT $3"
        ))
        .bind(org_id)
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(row_to_opportunity)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn record_scores(&self, org_id: Uuid, scores: &[(Uuid, u8)]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (id, score) in scores {
            sqlx::query("UPDATE opportunities SET latest_score = $3 WHERE id = $1 AND org_id = $2")
                .bind(id)
                .bind(org_id)
                .bind(i16::from(*score))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn count_for_org(&self, org_id: Option<Uuid>) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM opportunities WHERE org_id IS NOT DISTINCT FROM $1",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_per_org_scope() {
        let org = Uuid::new_v4();
        assert_eq!(advisory_key(Some(org)), advisory_key(Some(org)));
        assert_eq!(advisory_key(None), 0);
    }
}
