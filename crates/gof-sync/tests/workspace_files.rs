use std::path::PathBuf;

use gof_adapters::SourceKind;
use gof_sync::{load_scoring_policy, load_vocabulary, ScoringPolicy, SourceRegistry, YamlOrgProfileProvider};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[test]
fn sources_yaml_declares_every_connector_kind() {
    let registry = SourceRegistry::load(workspace_root().join("sources.yaml")).unwrap();
    let kinds = registry.enabled().map(|s| s.kind).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            SourceKind::NewsFeed,
            SourceKind::FederalRegistry,
            SourceKind::FoundationTransactions
        ]
    );
    let foundation = &registry.sources[2];
    assert_eq!(foundation.api_key_env.as_deref(), Some("GOF_FOUNDATION_API_KEY"));
}

#[test]
fn rule_files_match_built_in_defaults() {
    let rules = workspace_root().join("rules");
    let policy = load_scoring_policy(&rules).unwrap();
    let defaults = ScoringPolicy::default();
    assert_eq!(policy.taxonomy_hit, defaults.taxonomy_hit);
    assert_eq!(policy.keyword_cap, defaults.keyword_cap);
    assert_eq!(policy.recency.len(), defaults.recency.len());
    assert_eq!(policy.max_score, 100);

    let vocabulary = load_vocabulary(&rules).unwrap();
    let codes = vocabulary.codes_for("after-school tutoring and a food bank");
    assert!(codes.contains("B"));
    assert!(codes.contains("O"));
    assert!(codes.contains("K"));
}

#[tokio::test]
async fn organizations_yaml_loads() {
    let provider = YamlOrgProfileProvider::load(workspace_root().join("organizations.yaml")).unwrap();
    let orgs = provider.organizations().await;
    assert_eq!(orgs.len(), 2);
    assert!(orgs.iter().any(|o| o.locations == ["Chicago", "IL"]));
}
