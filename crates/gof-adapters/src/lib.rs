//! Source connector contracts, fixture-first connector implementations and the normalizer.

use std::fs;
use std::future::Future;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gof_core::{parse_loose_date, QueryProfile, RawOpportunity, SourceNotes};
use gof_storage::{FetchError, FetchedResponse, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub mod federal;
pub mod foundation;
pub mod news;
pub mod normalize;

pub use federal::FederalRegistryConnector;
pub use foundation::FoundationTransactionConnector;
pub use news::NewsFeedConnector;
pub use normalize::{MalformedRecord, Normalizer};

pub const CRATE_NAME: &str = "gof-adapters";

pub const DEFAULT_WINDOW_DAYS: i64 = 45;
pub const DEFAULT_RESULT_CAP: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    NewsFeed,
    FederalRegistry,
    FoundationTransactions,
}

impl SourceKind {
    pub fn api_label(self) -> &'static str {
        match self {
            SourceKind::NewsFeed => "rss",
            SourceKind::FederalRegistry => "grants-search",
            SourceKind::FoundationTransactions => "grants-transactions",
        }
    }
}

/// Per-run inputs handed to every connector call.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
    pub window_days: i64,
    pub result_cap: usize,
    /// Hard stop for all network I/O of this run.
    pub deadline: tokio::time::Instant,
}

impl FetchContext {
    pub fn new(run_id: Uuid, now: DateTime<Utc>, deadline: tokio::time::Instant) -> Self {
        Self {
            run_id,
            now,
            window_days: DEFAULT_WINDOW_DAYS,
            result_cap: DEFAULT_RESULT_CAP,
            deadline,
        }
    }

    /// Undated or unparseable dates are kept; only dates provably older than the window drop.
    pub fn within_window(&self, raw_date: Option<&str>) -> bool {
        match raw_date.and_then(parse_loose_date) {
            Some(date) => (self.now.date_naive() - date).num_days() <= self.window_days,
            None => true,
        }
    }

    pub fn window_label(&self) -> String {
        format!("{}d", self.window_days)
    }
}

/// Records one connector produced in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceBatch {
    pub records: Vec<RawOpportunity>,
    /// Records dropped for failing the connector's shape checks.
    pub malformed: usize,
    pub notes: SourceNotes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableKind {
    Timeout,
    Auth,
    RateLimited,
    Transport,
    Status,
    /// Task aborted when the run deadline fired.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id} unavailable ({kind:?}): {detail}")]
    Unavailable {
        source_id: String,
        kind: UnavailableKind,
        detail: String,
    },
    #[error("source {source_id} returned a malformed payload: {detail}")]
    Malformed { source_id: String, detail: String },
}

impl SourceError {
    pub fn unavailable(source_id: &str, kind: UnavailableKind, detail: impl Into<String>) -> Self {
        SourceError::Unavailable {
            source_id: source_id.to_string(),
            kind,
            detail: detail.into(),
        }
    }

    pub fn malformed(source_id: &str, detail: impl Into<String>) -> Self {
        SourceError::Malformed {
            source_id: source_id.to_string(),
            detail: detail.into(),
        }
    }

    pub fn source_id(&self) -> &str {
        match self {
            SourceError::Unavailable { source_id, .. } | SourceError::Malformed { source_id, .. } => {
                source_id
            }
        }
    }

    pub fn from_fetch(source_id: &str, err: FetchError) -> Self {
        let kind = if err.is_auth() {
            UnavailableKind::Auth
        } else if err.is_rate_limited() {
            UnavailableKind::RateLimited
        } else if err.is_timeout() {
            UnavailableKind::Timeout
        } else if matches!(err, FetchError::HttpStatus { .. }) {
            UnavailableKind::Status
        } else {
            UnavailableKind::Transport
        };
        Self::unavailable(source_id, kind, err.to_string())
    }
}

/// Adapter to one external opportunity feed.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Performs network I/O, bounded by `ctx.deadline`, then parses.
    async fn fetch(
        &self,
        http: &HttpFetcher,
        profile: &QueryProfile,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, SourceError>;

    /// Pure parse of a captured response body.
    fn parse(
        &self,
        body: &[u8],
        profile: &QueryProfile,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, SourceError>;
}

/// Runs one request future under the run deadline, mapping failures to `SourceError`.
pub async fn fetch_within_deadline<F>(
    source_id: &str,
    ctx: &FetchContext,
    request: F,
) -> Result<FetchedResponse, SourceError>
where
    F: Future<Output = Result<FetchedResponse, FetchError>>,
{
    match tokio::time::timeout_at(ctx.deadline, request).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) => Err(SourceError::from_fetch(source_id, err)),
        Err(_) => Err(SourceError::unavailable(
            source_id,
            UnavailableKind::Timeout,
            "run deadline reached",
        )),
    }
}

/// Connector wiring resolved from the source registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorSettings {
    pub source_id: String,
    pub kind: SourceKind,
    pub endpoint: String,
    /// Name of the environment variable holding the API key, when the source needs one.
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
}

pub fn connector_for(settings: &ConnectorSettings) -> Box<dyn SourceConnector> {
    match settings.kind {
        SourceKind::NewsFeed => Box::new(NewsFeedConnector::new(
            settings.source_id.clone(),
            settings.endpoint.clone(),
        )),
        SourceKind::FederalRegistry => Box::new(FederalRegistryConnector::new(
            settings.source_id.clone(),
            settings.endpoint.clone(),
        )),
        SourceKind::FoundationTransactions => {
            if settings.api_key_env.is_some() && settings.api_key.is_none() {
                warn!(
                    source = settings.source_id.as_str(),
                    "api key variable is unset; source will report auth failures"
                );
            }
            Box::new(FoundationTransactionConnector::new(
                settings.source_id.clone(),
                settings.endpoint.clone(),
                settings.api_key_env.is_some(),
                settings.api_key.clone(),
            ))
        }
    }
}

/// Collapses whitespace; empty input becomes `None`.
pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Captured source response plus the context it was captured under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub kind: SourceKind,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub raw_artifact: String,
    #[serde(default)]
    pub profile: QueryProfile,
    #[serde(skip)]
    pub raw_body: Vec<u8>,
}

impl FixtureBundle {
    pub fn context(&self) -> FetchContext {
        FetchContext::new(
            Uuid::nil(),
            self.fetched_at,
            tokio::time::Instant::now() + std::time::Duration::from_secs(60),
        )
    }
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    let raw_path = path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(&bundle.raw_artifact);
    bundle.raw_body = fs::read(&raw_path)
        .with_context(|| format!("reading fixture raw artifact {}", raw_path.display()))?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::PathBuf;

    /// Golden projection of a raw record compared against `snapshot.json`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct GoldenRecord {
        pub title: String,
        pub funder: String,
        pub amount_min: Option<f64>,
        pub amount_max: Option<f64>,
        pub posted: Option<String>,
        pub deadline: Option<String>,
        pub url: Option<String>,
    }

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture_dir(source_id: &str) -> PathBuf {
        workspace_root().join("fixtures").join(source_id).join("sample")
    }

    pub fn load_sample(source_id: &str) -> FixtureBundle {
        load_fixture_bundle(fixture_dir(source_id).join("bundle.json")).expect("fixture bundle")
    }

    pub fn read_snapshot(source_id: &str) -> Vec<GoldenRecord> {
        let text = fs::read_to_string(fixture_dir(source_id).join("snapshot.json")).expect("read snapshot");
        serde_json::from_str(&text).expect("parse snapshot")
    }

    pub fn to_golden(batch: &SourceBatch) -> Vec<GoldenRecord> {
        batch
            .records
            .iter()
            .map(|r| GoldenRecord {
                title: r.title.clone(),
                funder: r.funder.clone(),
                amount_min: r.amount_min,
                amount_max: r.amount_max,
                posted: r.posted.clone(),
                deadline: r.deadline.clone(),
                url: r.url.clone(),
            })
            .collect()
    }
}
