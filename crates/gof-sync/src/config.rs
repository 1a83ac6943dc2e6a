//! Environment configuration, source registry and YAML rule files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gof_adapters::{ConnectorSettings, SourceKind, DEFAULT_RESULT_CAP, DEFAULT_WINDOW_DAYS};
use gof_core::{SubjectVocabulary, VocabularyEntry};
use serde::Deserialize;

use crate::scoring::ScoringPolicy;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub run_deadline: Duration,
    pub registry_timeout: Duration,
    pub result_cap: usize,
    pub scoring_batch: usize,
    pub window_days: i64,
    pub staleness_hours: i64,
    pub workspace_root: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            user_agent: "gof-bot/0.1".to_string(),
            http_timeout_secs: 15,
            run_deadline: Duration::from_millis(8_000),
            registry_timeout: Duration::from_millis(2_000),
            result_cap: DEFAULT_RESULT_CAP,
            scoring_batch: 15,
            window_days: DEFAULT_WINDOW_DAYS,
            staleness_hours: gof_storage::DEFAULT_STALENESS_HOURS,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            user_agent: lookup("GOF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: number("GOF_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            run_deadline: number("GOF_RUN_DEADLINE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.run_deadline),
            registry_timeout: number("GOF_REGISTRY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.registry_timeout),
            result_cap: number("GOF_RESULT_CAP")
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(defaults.result_cap),
            scoring_batch: number("GOF_SCORING_BATCH")
                .map(|v| v as usize)
                .unwrap_or(defaults.scoring_batch),
            window_days: defaults.window_days,
            staleness_hours: defaults.staleness_hours,
            workspace_root: lookup("GOF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn organizations_path(&self) -> PathBuf {
        self.workspace_root.join("organizations.yaml")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.workspace_root.join("rules")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub result_cap: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    /// Resolves the API key from the environment at call time.
    pub fn settings(&self) -> ConnectorSettings {
        ConnectorSettings {
            source_id: self.source_id.clone(),
            kind: self.kind,
            endpoint: self.endpoint.clone(),
            api_key_env: self.api_key_env.clone(),
            api_key: self
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.trim().is_empty()),
        }
    }
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Deserialize)]
struct VocabularyFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    entries: Vec<VocabularyEntry>,
}

#[derive(Debug, Deserialize)]
struct ScoringFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    policy: ScoringPolicy,
}

/// `rules/vocabulary.yaml` when present, the built-in table otherwise.
pub fn load_vocabulary(rules_dir: &Path) -> Result<SubjectVocabulary> {
    let path = rules_dir.join("vocabulary.yaml");
    if !path.exists() {
        return Ok(SubjectVocabulary::default());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: VocabularyFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if file.entries.is_empty() {
        return Ok(SubjectVocabulary::default());
    }
    Ok(SubjectVocabulary {
        entries: file.entries,
    })
}

/// `rules/scoring.yaml` when present, default weights otherwise.
pub fn load_scoring_policy(rules_dir: &Path) -> Result<ScoringPolicy> {
    let path = rules_dir.join("scoring.yaml");
    if !path.exists() {
        return Ok(ScoringPolicy::default());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: ScoringFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.policy)
}
