//! Discovery run orchestration: profile, bounded fan-out, normalize, persist, score.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gof_adapters::{
    FetchContext, Normalizer, SourceBatch, SourceConnector, SourceError, UnavailableKind,
};
use gof_core::{
    DiscoveryStats, Opportunity, OrgProfile, QueryProfile, RunState, ScoredOpportunity,
};
use gof_storage::{
    CacheKey, HttpFetcher, OpportunityStore, OrgRunLocks, TtlCache, SOURCE_RESULT_TTL,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::dedup::Deduplicator;
use crate::profile::{OrgProfileProvider, TokenBuilder};
use crate::scoring::{rank, AiScorer, MarketSnapshot, ScoringEngine};

pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("organization {org_id} unavailable: {reason}")]
    ProfileUnavailable { org_id: Uuid, reason: String },
    #[error("no source produced data and no persisted opportunities exist for {org_id} (failed: {failed:?})")]
    AllSourcesFailed { org_id: Uuid, failed: Vec<String> },
    #[error("limit must be between 1 and {MAX_LIMIT}, got {0}")]
    InvalidLimit(usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub run_id: Uuid,
    pub opportunities: Vec<ScoredOpportunity>,
    pub stats: DiscoveryStats,
    pub degraded: bool,
    pub state: RunState,
}

/// One configured connector plus its own budget.
#[derive(Clone)]
pub struct RegisteredSource {
    pub connector: Arc<dyn SourceConnector>,
    pub timeout: Duration,
    pub result_cap: usize,
}

/// Tracks and logs state machine transitions for one run.
struct RunTracker {
    run_id: Uuid,
    state: RunState,
}

impl RunTracker {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            warn!(run_id = %self.run_id, from = ?self.state, to = ?next, "unexpected run state transition");
        }
        info!(run_id = %self.run_id, from = ?self.state, to = ?next, "run state");
        self.state = next;
    }
}

pub struct DiscoveryPipeline {
    config: DiscoveryConfig,
    http: Arc<HttpFetcher>,
    sources: Vec<RegisteredSource>,
    profiles: Arc<dyn OrgProfileProvider>,
    token_builder: TokenBuilder,
    normalizer: Normalizer,
    scoring: ScoringEngine,
    dedup: Deduplicator,
    store: Arc<dyn OpportunityStore>,
    cache: Arc<TtlCache<CacheKey, SourceBatch>>,
    locks: Arc<OrgRunLocks>,
    ai_scorer: Option<Arc<dyn AiScorer>>,
    market_median: Option<f64>,
}

impl DiscoveryPipeline {
    pub fn new(
        config: DiscoveryConfig,
        http: Arc<HttpFetcher>,
        profiles: Arc<dyn OrgProfileProvider>,
        store: Arc<dyn OpportunityStore>,
    ) -> Self {
        let staleness = chrono::Duration::hours(config.staleness_hours);
        Self {
            token_builder: TokenBuilder::new(Default::default(), config.registry_timeout),
            dedup: Deduplicator::new(store.clone(), staleness),
            config,
            http,
            sources: Vec::new(),
            profiles,
            normalizer: Normalizer::default(),
            scoring: ScoringEngine::default(),
            store,
            cache: Arc::new(TtlCache::new()),
            locks: Arc::new(OrgRunLocks::new()),
            ai_scorer: None,
            market_median: None,
        }
    }

    /// Adds a connector bounded by `timeout` and its own result cap.
    pub fn with_source(mut self, connector: Arc<dyn SourceConnector>, timeout: Duration, result_cap: usize) -> Self {
        self.sources.push(RegisteredSource {
            connector,
            timeout,
            result_cap,
        });
        self
    }

    pub fn with_token_builder(mut self, token_builder: TokenBuilder) -> Self {
        self.token_builder = token_builder;
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringEngine) -> Self {
        self.scoring = scoring;
        self
    }

    /// Shares the source-result cache with other pipelines in the process.
    pub fn with_cache(mut self, cache: Arc<TtlCache<CacheKey, SourceBatch>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_run_locks(mut self, locks: Arc<OrgRunLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_ai_scorer(mut self, scorer: Arc<dyn AiScorer>) -> Self {
        self.ai_scorer = Some(scorer);
        self
    }

    /// Fixed typical award; otherwise the run's own median is used.
    pub fn with_market_median(mut self, median: f64) -> Self {
        self.market_median = Some(median);
        self
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .map(|s| s.connector.source_id().to_string())
            .collect()
    }

    pub async fn discover(
        &self,
        org_id: Uuid,
        limit: usize,
        force_refresh: bool,
    ) -> Result<DiscoveryResponse, DiscoveryError> {
        self.discover_at(org_id, limit, force_refresh, Utc::now()).await
    }

    pub async fn discover_at(
        &self,
        org_id: Uuid,
        limit: usize,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<DiscoveryResponse, DiscoveryError> {
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(DiscoveryError::InvalidLimit(limit));
        }
        let _guard = self.locks.acquire(org_id).await;
        let run_id = Uuid::new_v4();
        let span = info_span!("discovery_run", %run_id, %org_id, limit, force_refresh);
        self.run(run_id, org_id, limit, force_refresh, now)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        run_id: Uuid,
        org_id: Uuid,
        limit: usize,
        force_refresh: bool,
        now: DateTime<Utc>,
    ) -> Result<DiscoveryResponse, DiscoveryError> {
        let mut tracker = RunTracker::new(run_id);
        let mut stats = DiscoveryStats::default();

        let org = match self.profiles.get_profile(org_id).await {
            Ok(Some(org)) => org,
            Ok(None) => {
                return Err(DiscoveryError::ProfileUnavailable {
                    org_id,
                    reason: "not found".to_string(),
                })
            }
            Err(err) => {
                return Err(DiscoveryError::ProfileUnavailable {
                    org_id,
                    reason: err.to_string(),
                })
            }
        };

        let (profile, enrichment) = self.token_builder.build(&org).await;
        if let Some(enrichment) = enrichment {
            if let Err(err) = self.profiles.save_enrichment(org_id, &enrichment).await {
                warn!(%org_id, error = %err, "could not store registry enrichment");
            }
        }
        debug!(query = profile.query_params().as_str(), "query profile resolved");
        tracker.advance(RunState::TokenResolved);

        let deadline = Instant::now() + self.config.run_deadline;
        tracker.advance(RunState::Fetching);
        let batches = self
            .fetch_all(run_id, &profile, force_refresh, now, deadline, &mut stats)
            .await;
        let fetched_records = batches.iter().map(|(_, b)| b.records.len()).sum::<usize>();

        if fetched_records == 0 {
            let all_failed = stats.all_sources_failed();
            let fallback = self.fallback(org_id, limit, now).await;
            if !fallback.is_empty() {
                stats.fallback_used = true;
                tracker.advance(RunState::Degraded);
                tracker.advance(RunState::Scoring);
                let scored = self
                    .score(run_id, &org, &profile, fallback, limit, now, deadline)
                    .await;
                tracker.advance(RunState::Degraded);
                return Ok(self.respond(run_id, scored, stats, tracker.state));
            }
            if all_failed {
                tracker.advance(RunState::Degraded);
                tracker.advance(RunState::Failed);
                warn!(%org_id, failed = ?stats.sources_failed, "no fresh, cached or persisted data");
                return Err(DiscoveryError::AllSourcesFailed {
                    org_id,
                    failed: stats.sources_failed.clone(),
                });
            }
        }

        tracker.advance(RunState::Normalizing);
        let normalized = self.normalize(batches, now, &mut stats);
        stats.discovered = normalized.len();

        tracker.advance(RunState::Persisting);
        let to_score = match self.dedup.persist(org_id, normalized.clone(), now).await {
            Ok(outcome) => {
                stats.created = outcome.created();
                stats.updated = outcome.updated();
                stats.duplicates = outcome.duplicates();
                stats.persistence_failures = outcome.commit.conflicts;
                info!(
                    created = stats.created,
                    updated = stats.updated,
                    duplicates = stats.duplicates,
                    conflicts = outcome.commit.conflicts,
                    "run committed"
                );
                outcome.opportunities()
            }
            Err(err) => {
                warn!(%org_id, error = %err, "persistence failed; run rolled back, scoring in memory");
                stats.persistence_failed = true;
                stats.persistence_failures += 1;
                let (collapsed, _) = Deduplicator::collapse(normalized);
                collapsed
                    .into_iter()
                    .map(|mut o| {
                        o.org_id = Some(org_id);
                        o
                    })
                    .collect()
            }
        };

        let degraded = !stats.sources_failed.is_empty() || stats.persistence_failed;
        if stats.persistence_failed {
            tracker.advance(RunState::Degraded);
        }
        tracker.advance(RunState::Scoring);
        let scored = self
            .score(run_id, &org, &profile, to_score, limit, now, deadline)
            .await;

        if !stats.persistence_failed {
            let scores = scored
                .iter()
                .map(|s| (s.opportunity.id, s.score))
                .collect::<Vec<_>>();
            if let Err(err) = self.store.record_scores(org_id, &scores).await {
                warn!(%org_id, error = %err, "could not cache latest scores");
            }
        }

        tracker.advance(if degraded { RunState::Degraded } else { RunState::Done });
        Ok(self.respond(run_id, scored, stats, tracker.state))
    }

    fn respond(
        &self,
        run_id: Uuid,
        opportunities: Vec<ScoredOpportunity>,
        stats: DiscoveryStats,
        state: RunState,
    ) -> DiscoveryResponse {
        let degraded = state == RunState::Degraded;
        info!(
            %run_id,
            returned = opportunities.len(),
            degraded,
            sources_failed = stats.sources_failed.len(),
            "discovery run finished"
        );
        DiscoveryResponse {
            run_id,
            opportunities,
            stats,
            degraded,
            state,
        }
    }

    /// Cache reads first, then one task per remaining source, all bounded by the run deadline.
    async fn fetch_all(
        &self,
        run_id: Uuid,
        profile: &QueryProfile,
        force_refresh: bool,
        now: DateTime<Utc>,
        deadline: Instant,
        stats: &mut DiscoveryStats,
    ) -> Vec<(String, SourceBatch)> {
        let params = profile.query_params();
        let mut batches = Vec::new();
        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();

        for source in &self.sources {
            let source_id = source.connector.source_id().to_string();
            stats.sources_attempted.push(source_id.clone());
            let key = CacheKey::new(source_id.clone(), &params);

            if !force_refresh {
                if let Some(batch) = self.cache.get(&key).await {
                    debug!(source = source_id.as_str(), "source result served from cache");
                    stats.sources_cached.push(source_id.clone());
                    batches.push((source_id, batch));
                    continue;
                }
            }

            let mut ctx = FetchContext::new(run_id, now, deadline);
            ctx.window_days = self.config.window_days;
            ctx.result_cap = source.result_cap.min(self.config.result_cap).max(1);

            let connector = source.connector.clone();
            let http = self.http.clone();
            let profile = profile.clone();
            let timeout = source.timeout;
            pending.insert(source_id.clone());
            let span = info_span!("source_fetch", source = source_id.as_str());
            tasks.spawn(
                async move {
                    let result = match tokio::time::timeout(timeout, connector.fetch(&http, &profile, &ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(SourceError::unavailable(
                            &source_id,
                            UnavailableKind::Timeout,
                            format!("no response within {}ms", timeout.as_millis()),
                        )),
                    };
                    (source_id, key, result)
                }
                .instrument(span),
            );
        }

        loop {
            let joined = tokio::time::timeout_at(deadline, tasks.join_next()).await;
            match joined {
                Ok(Some(Ok((source_id, key, result)))) => {
                    pending.remove(&source_id);
                    match result {
                        Ok(batch) => {
                            info!(
                                source = source_id.as_str(),
                                records = batch.records.len(),
                                malformed = batch.malformed,
                                "source fetched"
                            );
                            self.cache.set(key, batch.clone(), SOURCE_RESULT_TTL).await;
                            batches.push((source_id, batch));
                        }
                        Err(err) => {
                            warn!(source = source_id.as_str(), error = %err, "source unavailable");
                            stats.mark_failed(&source_id);
                        }
                    }
                }
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "source task aborted");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = ?pending, "run deadline reached; abandoning slow sources");
                    tasks.abort_all();
                    break;
                }
            }
        }

        for source_id in pending {
            let err = SourceError::unavailable(&source_id, UnavailableKind::Cancelled, "run deadline reached");
            debug!(error = %err, "source cancelled");
            stats.mark_failed(&source_id);
        }
        batches
    }

    fn normalize(
        &self,
        batches: Vec<(String, SourceBatch)>,
        now: DateTime<Utc>,
        stats: &mut DiscoveryStats,
    ) -> Vec<Opportunity> {
        let mut out = Vec::new();
        for (source_id, batch) in batches {
            stats.malformed += batch.malformed;
            for raw in &batch.records {
                match self.normalizer.normalize(raw, &source_id, &batch.notes, now) {
                    Ok(opportunity) => out.push(opportunity),
                    Err(err) => {
                        warn!(source = source_id.as_str(), error = %err, "skipping malformed record");
                        stats.malformed += 1;
                    }
                }
            }
        }
        out
    }

    /// Last 24h of persisted opportunities, else whatever exists.
    async fn fallback(&self, org_id: Uuid, limit: usize, now: DateTime<Utc>) -> Vec<Opportunity> {
        let fetch = limit.max(self.config.scoring_batch);
        let since = now - chrono::Duration::hours(self.config.staleness_hours);
        match self.store.recent_for_org(org_id, Some(since), fetch).await {
            Ok(recent) if !recent.is_empty() => return recent,
            Ok(_) => {}
            Err(err) => {
                warn!(%org_id, error = %err, "fallback read failed");
                return Vec::new();
            }
        }
        match self.store.recent_for_org(org_id, None, fetch).await {
            Ok(best_available) => best_available,
            Err(err) => {
                warn!(%org_id, error = %err, "fallback read failed");
                Vec::new()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn score(
        &self,
        run_id: Uuid,
        org: &OrgProfile,
        profile: &QueryProfile,
        opportunities: Vec<Opportunity>,
        limit: usize,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Vec<ScoredOpportunity> {
        let market = match self.market_median {
            Some(median) => MarketSnapshot::new(Some(median), now),
            None => MarketSnapshot::from_opportunities(&opportunities, now),
        };
        let mut scored = opportunities
            .into_iter()
            .map(|o| {
                let result = self.scoring.score(&o, profile, &market);
                ScoredOpportunity::new(o, result)
            })
            .collect::<Vec<_>>();
        rank(&mut scored);

        if let Some(ai) = &self.ai_scorer {
            self.apply_ai_scores(run_id, ai.clone(), org, &mut scored, deadline)
                .await;
            rank(&mut scored);
        }

        scored.truncate(limit);
        scored
    }

    /// Rescores the best heuristic matches, at most `scoring_batch` of them.
    /// Assessments still outstanding at the run deadline are dropped.
    async fn apply_ai_scores(
        &self,
        run_id: Uuid,
        ai: Arc<dyn AiScorer>,
        org: &OrgProfile,
        scored: &mut [ScoredOpportunity],
        deadline: Instant,
    ) {
        let batch = self.config.scoring_batch.min(scored.len());
        let mut tasks = JoinSet::new();
        for (index, item) in scored.iter().take(batch).enumerate() {
            let ai = ai.clone();
            let org = org.clone();
            let opportunity = item.opportunity.clone();
            tasks.spawn(async move { (index, ai.score(&org, &opportunity).await) });
        }

        loop {
            let joined = match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(joined)) => joined,
                Ok(None) => break,
                Err(_) => {
                    warn!(%run_id, outstanding = tasks.len(), "run deadline reached; keeping heuristic scores");
                    tasks.abort_all();
                    break;
                }
            };
            match joined {
                Ok((index, Ok(assessment))) => {
                    let item = &mut scored[index];
                    item.score = assessment.match_score.min(100);
                    item.reasons.push(format!("AI assessment: {}", assessment.rationale));
                }
                Ok((index, Err(err))) => {
                    warn!(%run_id, index, error = %err, "ai scorer failed; keeping heuristic score");
                }
                Err(err) => warn!(%run_id, error = %err, "ai scorer task aborted"),
            }
        }
    }
}
