//! Discovery orchestration: configuration, profile resolution, scoring, dedup and the run pipeline.

pub mod config;
pub mod dedup;
pub mod pipeline;
pub mod profile;
pub mod scoring;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gof_adapters::connector_for;
use gof_storage::{
    HttpClientConfig, HttpFetcher, MemoryOpportunityStore, OpportunityStore, PgOpportunityStore, TtlCache,
};
use tracing::{info, warn};

pub use config::{load_scoring_policy, load_vocabulary, DiscoveryConfig, SourceConfig, SourceRegistry};
pub use dedup::{Deduplicator, PersistOutcome};
pub use pipeline::{DiscoveryError, DiscoveryPipeline, DiscoveryResponse, RegisteredSource, MAX_LIMIT};
pub use profile::{
    ExternalRegistryLookup, MemoryOrgProfileProvider, OrgProfileProvider, ProPublicaRegistryLookup,
    ProfileEnrichment, ProfileError, RegistryRecord, TokenBuilder, YamlOrgProfileProvider,
    PROPUBLICA_BASE_URL,
};
pub use scoring::{rank, AiAssessment, AiScorer, FactorScores, MarketSnapshot, ScoringEngine, ScoringPolicy};

pub const CRATE_NAME: &str = "gof-sync";

/// Postgres when `DATABASE_URL` is set, an in-process store otherwise.
pub async fn store_from_config(config: &DiscoveryConfig) -> Result<Arc<dyn OpportunityStore>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgOpportunityStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; opportunities are kept in memory for this process only");
            Ok(Arc::new(MemoryOpportunityStore::new()))
        }
    }
}

/// Wires a pipeline from the workspace files named by `config`.
pub async fn build_pipeline(
    config: DiscoveryConfig,
    profiles: Arc<dyn OrgProfileProvider>,
    store: Arc<dyn OpportunityStore>,
) -> Result<DiscoveryPipeline> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);

    let rules_dir = config.rules_dir();
    let vocabulary = load_vocabulary(&rules_dir)?;
    let policy = load_scoring_policy(&rules_dir)?;
    let registry = SourceRegistry::load(config.sources_path())?;

    let token_builder = TokenBuilder::new(vocabulary.clone(), config.registry_timeout)
        .with_registry(Arc::new(ProPublicaRegistryLookup::new(http.clone(), PROPUBLICA_BASE_URL)))
        .with_lookup_cache(Arc::new(TtlCache::new()));

    let default_timeout = Duration::from_secs(config.http_timeout_secs);
    let default_cap = config.result_cap;
    let mut pipeline = DiscoveryPipeline::new(config, http, profiles, store)
        .with_token_builder(token_builder)
        .with_normalizer(gof_adapters::Normalizer::new(vocabulary))
        .with_scoring(ScoringEngine::new(policy));

    for source in registry.enabled() {
        let connector = connector_for(&source.settings());
        pipeline = pipeline.with_source(
            Arc::from(connector),
            source.timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout),
            source.result_cap.unwrap_or(default_cap),
        );
    }
    info!(sources = ?pipeline.source_ids(), "discovery pipeline ready");
    Ok(pipeline)
}

/// Environment config, `organizations.yaml` profiles and the configured store.
pub async fn pipeline_from_env() -> Result<DiscoveryPipeline> {
    let config = DiscoveryConfig::from_env();
    let profiles = Arc::new(YamlOrgProfileProvider::load(config.organizations_path())?);
    let store = store_from_config(&config).await?;
    build_pipeline(config, profiles, store).await
}
