use std::path::{Path, PathBuf};

use gof_adapters::{connector_for, load_fixture_bundle, ConnectorSettings, Normalizer};

fn bundle_path(source_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(source_id)
        .join("sample")
        .join("bundle.json")
}

#[tokio::test]
async fn normalized_fixture_records_never_gain_amounts_or_dates() {
    let normalizer = Normalizer::default();
    for source_id in ["news-feed", "federal-registry", "foundation-transactions"] {
        let bundle = load_fixture_bundle(bundle_path(source_id)).unwrap();
        let connector = connector_for(&ConnectorSettings {
            source_id: bundle.source_id.clone(),
            kind: bundle.kind,
            endpoint: bundle.captured_from_url.clone(),
            api_key_env: None,
            api_key: None,
        });
        let batch = connector
            .parse(&bundle.raw_body, &bundle.profile, &bundle.context())
            .unwrap();
        assert!(!batch.records.is_empty(), "{source_id} produced no records");

        for raw in &batch.records {
            let o = normalizer
                .normalize(raw, connector.source_id(), &batch.notes, bundle.fetched_at)
                .unwrap();
            assert_eq!(o.amount_min.is_none(), raw.amount_min.is_none(), "{source_id}: {}", o.title);
            assert_eq!(o.amount_max.is_none(), raw.amount_max.is_none(), "{source_id}: {}", o.title);
            assert_eq!(o.deadline.is_none(), raw.deadline.is_none(), "{source_id}: {}", o.title);
            assert_eq!(o.source_notes, batch.notes);
            assert_eq!(o.stable_key.len(), 64);
        }
    }
}

#[tokio::test]
async fn stable_keys_are_reproducible_across_runs() {
    let normalizer = Normalizer::default();
    let bundle = load_fixture_bundle(bundle_path("federal-registry")).unwrap();
    let connector = connector_for(&ConnectorSettings {
        source_id: bundle.source_id.clone(),
        kind: bundle.kind,
        endpoint: bundle.captured_from_url.clone(),
        api_key_env: None,
        api_key: None,
    });
    let keys = |n: &Normalizer| {
        connector
            .parse(&bundle.raw_body, &bundle.profile, &bundle.context())
            .unwrap()
            .records
            .iter()
            .map(|r| n.normalize(r, "federal-registry", &Default::default(), bundle.fetched_at).unwrap().stable_key)
            .collect::<Vec<_>>()
    };
    assert_eq!(keys(&normalizer), keys(&normalizer));
}
