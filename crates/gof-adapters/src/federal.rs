//! Federal opportunity registry connector (grants.gov `search2` style JSON API).

use async_trait::async_trait;
use gof_core::{QueryProfile, RawOpportunity, SourceNotes};
use gof_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    fetch_within_deadline, text_or_none, FetchContext, SourceBatch, SourceConnector, SourceError,
    SourceKind,
};

const DETAIL_URL_BASE: &str = "https://www.grants.gov/search-results-detail";
const MAX_QUERY_KEYWORDS: usize = 4;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchEnvelope {
    #[serde(default)]
    errorcode: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<SearchData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchData {
    #[serde(default)]
    opp_hits: Vec<OppHit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OppHit {
    id: Option<Value>,
    number: Option<String>,
    title: Option<String>,
    agency: Option<String>,
    agency_name: Option<String>,
    agency_code: Option<String>,
    open_date: Option<String>,
    close_date: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FederalRegistryConnector {
    source_id: String,
    endpoint: String,
}

impl FederalRegistryConnector {
    pub fn new(source_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn keyword_query(profile: &QueryProfile) -> String {
        profile
            .keywords
            .iter()
            .take(MAX_QUERY_KEYWORDS)
            .cloned()
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn request_body(profile: &QueryProfile, ctx: &FetchContext) -> Value {
        json!({
            "keyword": Self::keyword_query(profile),
            "oppStatuses": "posted",
            "rows": ctx.result_cap,
        })
    }

    fn notes(&self, profile: &QueryProfile, ctx: &FetchContext) -> SourceNotes {
        SourceNotes {
            api: SourceKind::FederalRegistry.api_label().to_string(),
            query: format!("keyword={}", Self::keyword_query(profile)),
            window: ctx.window_label(),
        }
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => text_or_none(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| text_or_none(&v))
}

#[async_trait]
impl SourceConnector for FederalRegistryConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::FederalRegistry
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        profile: &QueryProfile,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, SourceError> {
        let body = Self::request_body(profile, ctx);
        let response = fetch_within_deadline(
            &self.source_id,
            ctx,
            http.post_json(ctx.run_id, &self.source_id, &self.endpoint, &body, &[]),
        )
        .await?;
        self.parse(&response.body, profile, ctx)
    }

    fn parse(
        &self,
        body: &[u8],
        profile: &QueryProfile,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, SourceError> {
        let envelope: SearchEnvelope = serde_json::from_slice(body)
            .map_err(|err| SourceError::malformed(&self.source_id, err.to_string()))?;
        if envelope.errorcode != 0 {
            return Err(SourceError::malformed(
                &self.source_id,
                format!(
                    "registry error {}: {}",
                    envelope.errorcode,
                    envelope.msg.unwrap_or_default()
                ),
            ));
        }

        let mut malformed = 0usize;
        let mut records = Vec::new();
        for hit in envelope.data.map(|d| d.opp_hits).unwrap_or_default() {
            let id = hit.id.as_ref().and_then(id_text);
            let title = non_empty(hit.title);
            let funder = non_empty(hit.agency)
                .or_else(|| non_empty(hit.agency_name))
                .or_else(|| non_empty(hit.agency_code));
            let (Some(id), Some(title), Some(funder)) = (id, title, funder) else {
                malformed += 1;
                continue;
            };

            let posted = non_empty(hit.open_date);
            if !ctx.within_window(posted.as_deref()) {
                continue;
            }

            records.push(RawOpportunity {
                title,
                funder,
                amount_min: None,
                amount_max: None,
                posted,
                deadline: non_empty(hit.close_date),
                url: Some(format!("{DETAIL_URL_BASE}/{id}")),
                description: non_empty(hit.number).map(|n| format!("Funding opportunity number {n}")),
                geography: None,
                eligibility: None,
                subject_codes: Vec::new(),
            });
            if records.len() == ctx.result_cap {
                break;
            }
        }

        Ok(SourceBatch {
            records,
            malformed,
            notes: self.notes(profile, ctx),
        })
    }
}
