//! Foundation grants-transaction connector (bearer-authenticated JSON API).

use async_trait::async_trait;
use gof_core::{QueryProfile, RawOpportunity, SourceNotes};
use gof_storage::HttpFetcher;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    fetch_within_deadline, text_or_none, FetchContext, SourceBatch, SourceConnector, SourceError,
    SourceKind, UnavailableKind,
};

#[derive(Debug, Deserialize)]
struct TransactionPage {
    #[serde(default)]
    grants: Vec<GrantTransaction>,
}

#[derive(Debug, Deserialize)]
struct GrantTransaction {
    funder_name: Option<String>,
    title: Option<String>,
    purpose: Option<String>,
    amount: Option<Value>,
    grant_date: Option<String>,
    recipient_city: Option<String>,
    recipient_state: Option<String>,
    #[serde(default)]
    subject_codes: Vec<String>,
    url: Option<String>,
    eligibility: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FoundationTransactionConnector {
    source_id: String,
    endpoint: String,
    api_key_required: bool,
    api_key: Option<String>,
}

impl FoundationTransactionConnector {
    pub fn new(
        source_id: impl Into<String>,
        endpoint: impl Into<String>,
        api_key_required: bool,
        api_key: Option<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            endpoint: endpoint.into(),
            api_key_required,
            api_key,
        }
    }

    pub fn request_url(&self, profile: &QueryProfile, ctx: &FetchContext) -> String {
        let mut url = format!(
            "{}?q={}&limit={}",
            self.endpoint,
            urlencoding::encode(&profile.keywords.join(" ")),
            ctx.result_cap
        );
        if let Some(location) = profile.locations.iter().find(|l| l.len() > 2) {
            url.push_str("&location=");
            url.push_str(&urlencoding::encode(location));
        }
        url
    }

    fn notes(&self, profile: &QueryProfile, ctx: &FetchContext) -> SourceNotes {
        SourceNotes {
            api: SourceKind::FoundationTransactions.api_label().to_string(),
            query: profile.query_params(),
            window: ctx.window_label(),
        }
    }
}

/// Amounts arrive as numbers or as "$12,500"-style strings.
fn amount_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    }
}

fn geography(city: Option<&str>, state: Option<&str>) -> Option<String> {
    let parts = [city, state]
        .into_iter()
        .flatten()
        .filter_map(text_or_none)
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

#[async_trait]
impl SourceConnector for FoundationTransactionConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::FoundationTransactions
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        profile: &QueryProfile,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, SourceError> {
        let mut headers = Vec::new();
        match &self.api_key {
            Some(key) => headers.push(("Authorization", format!("Bearer {key}"))),
            None if self.api_key_required => {
                return Err(SourceError::unavailable(
                    &self.source_id,
                    UnavailableKind::Auth,
                    "api key not configured",
                ));
            }
            None => {}
        }
        let url = self.request_url(profile, ctx);
        let response = fetch_within_deadline(
            &self.source_id,
            ctx,
            http.get_bytes(ctx.run_id, &self.source_id, &url, &headers),
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
        let page: TransactionPage = serde_json::from_slice(body)
            .map_err(|err| SourceError::malformed(&self.source_id, err.to_string()))?;

        let mut malformed = 0usize;
        let mut records = Vec::new();
        for grant in page.grants {
            let funder = grant.funder_name.as_deref().and_then(text_or_none);
            let title = grant
                .title
                .as_deref()
                .and_then(text_or_none)
                .or_else(|| grant.purpose.as_deref().and_then(text_or_none));
            let (Some(funder), Some(title)) = (funder, title) else {
                malformed += 1;
                continue;
            };

            let posted = grant.grant_date.as_deref().and_then(text_or_none);
            if !ctx.within_window(posted.as_deref()) {
                continue;
            }

            // A transaction records one concrete award, so both bounds are that award.
            let amount = grant.amount.as_ref().and_then(amount_value);
            records.push(RawOpportunity {
                title,
                funder,
                amount_min: amount,
                amount_max: amount,
                posted,
                deadline: None,
                url: grant.url.as_deref().and_then(text_or_none),
                description: grant.purpose.as_deref().and_then(text_or_none),
                geography: geography(grant.recipient_city.as_deref(), grant.recipient_state.as_deref()),
                eligibility: grant.eligibility.as_deref().and_then(text_or_none),
                subject_codes: grant.subject_codes,
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
