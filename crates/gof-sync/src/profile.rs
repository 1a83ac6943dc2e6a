//! Organization profiles, registry enrichment and query-profile construction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gof_core::{OrgProfile, QueryProfile, SubjectVocabulary};
use gof_storage::{CacheKey, HttpFetcher, TtlCache, PROFILE_LOOKUP_TTL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile backend failed: {0}")]
    Backend(String),
}

/// Read access to organization records, plus write-back of registry enrichment.
#[async_trait]
pub trait OrgProfileProvider: Send + Sync {
    async fn get_profile(&self, org_id: Uuid) -> Result<Option<OrgProfile>, ProfileError>;

    /// Applies enrichment to the stored record, filling only empty fields.
    async fn save_enrichment(&self, org_id: Uuid, enrichment: &ProfileEnrichment) -> Result<(), ProfileError>;
}

/// Public nonprofit registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegistryRecord {
    pub name: String,
    pub tax_id: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub subject_code: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[async_trait]
pub trait ExternalRegistryLookup: Send + Sync {
    async fn search(&self, name: &str, tax_id: Option<&str>) -> anyhow::Result<Option<RegistryRecord>>;
}

/// Fields the registry filled in because the stored record had none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProfileEnrichment {
    pub tax_id: Option<String>,
    pub locations: Vec<String>,
    pub subject_codes: Vec<String>,
}

impl ProfileEnrichment {
    pub fn is_empty(&self) -> bool {
        self.tax_id.is_none() && self.locations.is_empty() && self.subject_codes.is_empty()
    }

    /// Local values always win.
    pub fn apply_to(&self, org: &mut OrgProfile) {
        if org.tax_id.is_none() {
            org.tax_id = self.tax_id.clone();
        }
        if org.locations.is_empty() {
            org.locations = self.locations.clone();
        }
        if org.subject_codes.is_empty() {
            org.subject_codes = self.subject_codes.clone();
        }
    }
}

pub struct TokenBuilder {
    vocabulary: SubjectVocabulary,
    registry: Option<Arc<dyn ExternalRegistryLookup>>,
    lookup_budget: Duration,
    lookups: Arc<TtlCache<CacheKey, Option<RegistryRecord>>>,
}

impl TokenBuilder {
    pub fn new(vocabulary: SubjectVocabulary, lookup_budget: Duration) -> Self {
        Self {
            vocabulary,
            registry: None,
            lookup_budget,
            lookups: Arc::new(TtlCache::new()),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn ExternalRegistryLookup>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_lookup_cache(mut self, cache: Arc<TtlCache<CacheKey, Option<RegistryRecord>>>) -> Self {
        self.lookups = cache;
        self
    }

    /// Never fails: a slow or failing registry leaves the locally derived profile.
    pub async fn build(&self, org: &OrgProfile) -> (QueryProfile, Option<ProfileEnrichment>) {
        let mut profile = QueryProfile::default();

        for keyword in &org.keywords {
            profile.push_keyword(keyword);
        }
        for location in &org.locations {
            profile.push_location(location);
        }
        profile
            .subject_codes
            .extend(org.subject_codes.iter().map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty()));
        profile
            .population_codes
            .extend(org.population_codes.iter().map(|c| c.trim().to_uppercase()).filter(|c| !c.is_empty()));

        let mut derived_text = org.focus_areas.join(". ");
        if let Some(mission) = &org.mission {
            derived_text.push_str(". ");
            derived_text.push_str(mission);
        }
        for term in self.vocabulary.terms_in(&derived_text) {
            profile.push_keyword(&term);
        }
        let code_text = format!("{} {}", profile.keywords.join(" "), derived_text);
        profile.subject_codes.extend(self.vocabulary.codes_for(&code_text));

        if !profile.is_sparse() {
            return (profile, None);
        }

        let Some(record) = self.lookup(org).await else {
            return (profile, None);
        };

        // Registry keywords are deliberately not merged; only location and taxonomy fill gaps.
        let mut enrichment = ProfileEnrichment::default();
        if org.tax_id.is_none() {
            enrichment.tax_id = record.tax_id.clone();
        }
        if profile.locations.is_empty() {
            for location in [record.city.as_deref(), record.state.as_deref()].into_iter().flatten() {
                profile.push_location(location);
                enrichment.locations.push(location.to_string());
            }
        }
        if profile.subject_codes.is_empty() {
            if let Some(code) = record.subject_code.as_deref().and_then(|c| c.trim().get(..1)) {
                let code = code.to_uppercase();
                profile.subject_codes.insert(code.clone());
                enrichment.subject_codes.push(code);
            }
        }

        let enrichment = (!enrichment.is_empty()).then_some(enrichment);
        (profile, enrichment)
    }

    async fn lookup(&self, org: &OrgProfile) -> Option<RegistryRecord> {
        let registry = self.registry.as_ref()?;
        let key = CacheKey::new(
            "registry",
            &format!("name={};tax_id={}", org.name, org.tax_id.as_deref().unwrap_or_default()),
        );
        if let Some(cached) = self.lookups.get(&key).await {
            debug!(org = org.name.as_str(), "registry lookup served from cache");
            return cached;
        }

        match tokio::time::timeout(
            self.lookup_budget,
            registry.search(&org.name, org.tax_id.as_deref()),
        )
        .await
        {
            Ok(Ok(found)) => {
                self.lookups.set(key, found.clone(), PROFILE_LOOKUP_TTL).await;
                found
            }
            Ok(Err(err)) => {
                warn!(org = org.name.as_str(), error = %err, "registry lookup failed");
                None
            }
            Err(_) => {
                warn!(org = org.name.as_str(), budget_ms = self.lookup_budget.as_millis() as u64, "registry lookup timed out");
                None
            }
        }
    }
}

/// ProPublica Nonprofit Explorer API.
pub struct ProPublicaRegistryLookup {
    http: Arc<HttpFetcher>,
    base_url: String,
}

pub const PROPUBLICA_BASE_URL: &str = "https://projects.propublica.org/nonprofits/api/v2";

impl ProPublicaRegistryLookup {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn parse_org(value: &Value) -> Option<RegistryRecord> {
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
        };
        Some(RegistryRecord {
            name: text("name")?,
            tax_id: text("strein").or_else(|| value.get("ein").and_then(Value::as_u64).map(|e| e.to_string())),
            city: text("city"),
            state: text("state"),
            subject_code: text("ntee_code"),
            keywords: Vec::new(),
        })
    }

    /// Prefers an exact (case-insensitive) name match, else the first hit.
    pub fn parse_search(body: &[u8], name: &str) -> anyhow::Result<Option<RegistryRecord>> {
        let value: Value = serde_json::from_slice(body).context("parsing registry search response")?;
        let hits = value
            .get("organizations")
            .and_then(Value::as_array)
            .map(|orgs| orgs.iter().filter_map(Self::parse_org).collect::<Vec<_>>())
            .unwrap_or_default();
        let exact = hits.iter().position(|r| r.name.eq_ignore_ascii_case(name.trim()));
        Ok(match exact {
            Some(i) => hits.into_iter().nth(i),
            None => hits.into_iter().next(),
        })
    }

    pub fn parse_organization(body: &[u8]) -> anyhow::Result<Option<RegistryRecord>> {
        let value: Value = serde_json::from_slice(body).context("parsing registry organization response")?;
        Ok(value.get("organization").and_then(Self::parse_org))
    }
}

#[async_trait]
impl ExternalRegistryLookup for ProPublicaRegistryLookup {
    async fn search(&self, name: &str, tax_id: Option<&str>) -> anyhow::Result<Option<RegistryRecord>> {
        let ein = tax_id
            .map(|t| t.chars().filter(char::is_ascii_digit).collect::<String>())
            .filter(|d| d.len() == 9);
        let run_id = Uuid::nil();
        if let Some(ein) = ein {
            let url = format!("{}/organizations/{ein}.json", self.base_url);
            match self.http.get_bytes(run_id, "registry", &url, &[]).await {
                Ok(resp) => return Self::parse_organization(&resp.body),
                Err(err) if matches!(err, gof_storage::FetchError::HttpStatus { status: 404, .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        let url = format!("{}/search.json?q={}", self.base_url, urlencoding::encode(name));
        let resp = self.http.get_bytes(run_id, "registry", &url, &[]).await?;
        Self::parse_search(&resp.body, name)
    }
}

#[derive(Debug, Default)]
pub struct MemoryOrgProfileProvider {
    orgs: Mutex<HashMap<Uuid, OrgProfile>>,
}

impl MemoryOrgProfileProvider {
    pub fn new(orgs: impl IntoIterator<Item = OrgProfile>) -> Self {
        Self {
            orgs: Mutex::new(orgs.into_iter().map(|o| (o.id, o)).collect()),
        }
    }

    pub async fn all(&self) -> Vec<OrgProfile> {
        let mut orgs = self.orgs.lock().await.values().cloned().collect::<Vec<_>>();
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        orgs
    }
}

#[async_trait]
impl OrgProfileProvider for MemoryOrgProfileProvider {
    async fn get_profile(&self, org_id: Uuid) -> Result<Option<OrgProfile>, ProfileError> {
        Ok(self.orgs.lock().await.get(&org_id).cloned())
    }

    async fn save_enrichment(&self, org_id: Uuid, enrichment: &ProfileEnrichment) -> Result<(), ProfileError> {
        if let Some(org) = self.orgs.lock().await.get_mut(&org_id) {
            enrichment.apply_to(org);
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrganizationsFile {
    version: u32,
    #[serde(default)]
    organizations: Vec<OrgProfile>,
}

/// Organizations declared in `organizations.yaml`; enrichment is written back to the file.
#[derive(Debug)]
pub struct YamlOrgProfileProvider {
    path: PathBuf,
    inner: MemoryOrgProfileProvider,
}

impl YamlOrgProfileProvider {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let file: OrganizationsFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), organizations = file.organizations.len(), "loaded organization profiles");
        Ok(Self {
            path,
            inner: MemoryOrgProfileProvider::new(file.organizations),
        })
    }

    pub async fn organizations(&self) -> Vec<OrgProfile> {
        self.inner.all().await
    }
}

#[async_trait]
impl OrgProfileProvider for YamlOrgProfileProvider {
    async fn get_profile(&self, org_id: Uuid) -> Result<Option<OrgProfile>, ProfileError> {
        self.inner.get_profile(org_id).await
    }

    async fn save_enrichment(&self, org_id: Uuid, enrichment: &ProfileEnrichment) -> Result<(), ProfileError> {
        self.inner.save_enrichment(org_id, enrichment).await?;
        let file = OrganizationsFile {
            version: 1,
            organizations: self.inner.all().await,
        };
        let text = serde_yaml::to_string(&file).map_err(|e| ProfileError::Backend(e.to_string()))?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| ProfileError::Backend(format!("writing {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubRegistry {
        record: Option<RegistryRecord>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl StubRegistry {
        fn new(record: Option<RegistryRecord>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                record,
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExternalRegistryLookup for StubRegistry {
        async fn search(&self, _name: &str, _tax_id: Option<&str>) -> anyhow::Result<Option<RegistryRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.record.clone())
        }
    }

    fn org(keywords: &[&str], mission: Option<&str>) -> OrgProfile {
        OrgProfile {
            id: Uuid::new_v4(),
            name: "Northside Learning Collective".into(),
            mission: mission.map(String::from),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ..OrgProfile::default()
        }
    }

    fn registry_record() -> RegistryRecord {
        RegistryRecord {
            name: "Northside Learning Collective".into(),
            tax_id: Some("36-1234567".into()),
            city: Some("Chicago".into()),
            state: Some("IL".into()),
            subject_code: Some("b28".into()),
            keywords: vec!["tutoring".into(), "charter".into()],
        }
    }

    #[tokio::test]
    async fn stored_keywords_and_vocabulary_terms_drive_codes() {
        let builder = TokenBuilder::new(SubjectVocabulary::default(), Duration::from_secs(2));
        let mut o = org(&["Education", "youth"], Some("We run after-school programs for children"));
        o.locations = vec!["Chicago".into(), "IL".into()];
        let (profile, enrichment) = builder.build(&o).await;
        assert_eq!(profile.keywords, vec!["education", "youth", "after-school", "children"]);
        assert!(profile.subject_codes.contains("B"));
        assert!(profile.subject_codes.contains("O"));
        assert_eq!(profile.locations.len(), 2);
        assert!(enrichment.is_none());
    }

    #[tokio::test]
    async fn sparse_profile_is_enriched_without_registry_keywords() {
        let registry = StubRegistry::new(Some(registry_record()), Duration::ZERO);
        let builder = TokenBuilder::new(SubjectVocabulary::default(), Duration::from_secs(2))
            .with_registry(registry.clone());
        let (profile, enrichment) = builder.build(&org(&[], None)).await;

        assert!(profile.keywords.is_empty());
        assert_eq!(profile.subject_codes.iter().collect::<Vec<_>>(), vec!["B"]);
        assert!(profile.locations.contains("Chicago"));
        let enrichment = enrichment.unwrap();
        assert_eq!(enrichment.tax_id.as_deref(), Some("36-1234567"));
        assert_eq!(enrichment.locations, vec!["Chicago", "IL"]);
    }

    #[tokio::test]
    async fn rich_profile_skips_registry() {
        let registry = StubRegistry::new(Some(registry_record()), Duration::ZERO);
        let builder = TokenBuilder::new(SubjectVocabulary::default(), Duration::from_secs(2))
            .with_registry(registry.clone());
        builder.build(&org(&["housing"], None)).await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_registry_falls_back_to_local_profile() {
        let registry = StubRegistry::new(Some(registry_record()), Duration::from_secs(10));
        let builder = TokenBuilder::new(SubjectVocabulary::default(), Duration::from_secs(2))
            .with_registry(registry);
        let (profile, enrichment) = builder.build(&org(&[], None)).await;
        assert!(profile.is_sparse());
        assert!(enrichment.is_none());
    }

    #[tokio::test]
    async fn registry_lookups_are_cached() {
        let registry = StubRegistry::new(None, Duration::ZERO);
        let builder = TokenBuilder::new(SubjectVocabulary::default(), Duration::from_secs(2))
            .with_registry(registry.clone());
        let o = org(&[], None);
        builder.build(&o).await;
        builder.build(&o).await;
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn propublica_payloads_parse() {
        let search = br#"{"total_results": 2, "organizations": [
            {"ein": 361111111, "strein": "36-1111111", "name": "Northside Learning Alliance", "city": "Evanston", "state": "IL", "ntee_code": "B90"},
            {"ein": 361234567, "strein": "36-1234567", "name": "NORTHSIDE LEARNING COLLECTIVE", "city": "Chicago", "state": "IL", "ntee_code": "B28"}
        ]}"#;
        let hit = ProPublicaRegistryLookup::parse_search(search, "Northside Learning Collective")
            .unwrap()
            .unwrap();
        assert_eq!(hit.city.as_deref(), Some("Chicago"));
        assert_eq!(hit.tax_id.as_deref(), Some("36-1234567"));

        let single = br#"{"organization": {"ein": 361234567, "name": "Northside Learning Collective", "state": "IL"}}"#;
        let org = ProPublicaRegistryLookup::parse_organization(single).unwrap().unwrap();
        assert_eq!(org.tax_id.as_deref(), Some("361234567"));
        assert_eq!(ProPublicaRegistryLookup::parse_search(br#"{"organizations": []}"#, "x").unwrap(), None);
    }

    #[tokio::test]
    async fn yaml_provider_writes_enrichment_back_filling_only_empty_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("organizations.yaml");
        let id = Uuid::new_v4();
        std::fs::write(
            &path,
            format!(
                "version: 1\norganizations:\n  - id: {id}\n    name: Northside Learning Collective\n    locations: [Evanston]\n"
            ),
        )
        .unwrap();

        let provider = YamlOrgProfileProvider::load(&path).unwrap();
        provider
            .save_enrichment(
                id,
                &ProfileEnrichment {
                    tax_id: Some("36-1234567".into()),
                    locations: vec!["Chicago".into()],
                    subject_codes: vec!["B".into()],
                },
            )
            .await
            .unwrap();

        let reloaded = YamlOrgProfileProvider::load(&path).unwrap();
        let org = reloaded.get_profile(id).await.unwrap().unwrap();
        assert_eq!(org.tax_id.as_deref(), Some("36-1234567"));
        assert_eq!(org.locations, vec!["Evanston"]);
        assert_eq!(org.subject_codes, vec!["B"]);
        assert!(reloaded.get_profile(Uuid::new_v4()).await.unwrap().is_none());
    }
}
