//! Philanthropy news feed connector (RSS/Atom).

use std::cmp::Ordering;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use gof_core::{contains_term, parse_loose_date, QueryProfile, RawOpportunity, SourceNotes};
use gof_storage::HttpFetcher;
use regex::Regex;
use tracing::debug;

use crate::{
    fetch_within_deadline, text_or_none, FetchContext, SourceBatch, SourceConnector, SourceError,
    SourceKind,
};

static RE_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));

static RE_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(up\s+to\s+)?\$\s?(\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?)(?:\s*(million|m|k)\b)?")
        .expect("amount regex")
});

static RE_DEADLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:deadline|due(?:\s+by)?|closes(?:\s+on)?)\s*(?:is\s+)?[:\-]?\s*((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2},\s*\d{4}|\d{1,2}/\d{1,2}/\d{4}|\d{4}-\d{2}-\d{2})",
    )
    .expect("deadline regex")
});

const RFP_MARKERS: &[&str] = &[
    "rfp",
    "rfa",
    "request for proposals",
    "requests proposals",
    "call for proposals",
    "request for applications",
    "call for applications",
    "letter of inquiry",
    "letters of inquiry",
];

const GRANT_MARKERS: &[&str] = &[
    "grant",
    "grants",
    "funding",
    "fellowship",
    "fellowships",
    "award",
    "awards",
];

const ACTION_VERBS: &[&str] = &[
    "apply",
    "applications",
    "applicants",
    "accepting",
    "invites",
    "seeks",
    "submit",
    "nominations",
];

/// Title phrases after which the funder name ends ("X Invites Proposals ...").
const FUNDER_MARKERS: &[&str] = &[
    " now accepting",
    " invites",
    " accepting",
    " seeks",
    " requests",
    " announces",
    " opens",
    " launches",
    " issues",
];

static RE_FUNDER_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives = FUNDER_MARKERS.iter().map(|m| regex::escape(m)).collect::<Vec<_>>();
    Regex::new(&format!("(?i){}", alternatives.join("|"))).expect("funder marker regex")
});

#[derive(Debug, Clone)]
pub struct NewsFeedConnector {
    source_id: String,
    endpoint: String,
}

impl NewsFeedConnector {
    pub fn new(source_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            endpoint: endpoint.into(),
        }
    }

    fn notes(&self, profile: &QueryProfile, ctx: &FetchContext) -> SourceNotes {
        SourceNotes {
            api: SourceKind::NewsFeed.api_label().to_string(),
            query: profile.query_params(),
            window: ctx.window_label(),
        }
    }
}

#[async_trait]
impl SourceConnector for NewsFeedConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::NewsFeed
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        profile: &QueryProfile,
        ctx: &FetchContext,
    ) -> Result<SourceBatch, SourceError> {
        let response = fetch_within_deadline(
            &self.source_id,
            ctx,
            http.get_bytes(ctx.run_id, &self.source_id, &self.endpoint, &[]),
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
        let feed = feed_rs::parser::parse(body)
            .map_err(|err| SourceError::malformed(&self.source_id, err.to_string()))?;
        let feed_title = feed.title.and_then(|t| text_or_none(&t.content));

        let mut malformed = 0usize;
        let mut ranked: Vec<(usize, Option<NaiveDate>, RawOpportunity)> = Vec::new();

        for entry in feed.entries {
            let Some(title) = entry.title.and_then(|t| text_or_none(&t.content)) else {
                malformed += 1;
                continue;
            };
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .map(|html| strip_html(&html))
                .and_then(|text| text_or_none(&text));

            let text = match &summary {
                Some(summary) => format!("{} {}", title, summary).to_lowercase(),
                None => title.to_lowercase(),
            };
            if !has_opportunity_signal(&text) {
                debug!(source = self.source_id.as_str(), title = title.as_str(), "skipping item without opportunity signal");
                continue;
            }

            let posted = entry
                .published
                .or(entry.updated)
                .map(|dt| dt.date_naive().to_string());
            if !ctx.within_window(posted.as_deref()) {
                continue;
            }

            let author = entry.authors.first().and_then(|p| text_or_none(&p.name));
            let Some(funder) = funder_from_title(&title).or(author).or_else(|| feed_title.clone())
            else {
                malformed += 1;
                continue;
            };

            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()));

            let body_text = summary.as_deref().unwrap_or_default();
            let (amount_min, amount_max) = extract_amounts(body_text);
            let deadline = RE_DEADLINE
                .captures(body_text)
                .and_then(|c| c.get(1))
                .and_then(|m| deadline_text(m.as_str()));

            let hits = profile
                .keywords
                .iter()
                .filter(|kw| contains_term(&text, kw))
                .count();
            let posted_date = posted.as_deref().and_then(parse_loose_date);

            ranked.push((
                hits,
                posted_date,
                RawOpportunity {
                    title,
                    funder,
                    amount_min,
                    amount_max,
                    posted,
                    deadline,
                    url,
                    eligibility: summary.as_deref().and_then(eligibility_sentence),
                    description: summary,
                    geography: None,
                    subject_codes: Vec::new(),
                },
            ));
        }

        ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| newest_first(a.1, b.1)));
        let mut records = ranked.into_iter().map(|(_, _, r)| r).collect::<Vec<_>>();
        records.truncate(ctx.result_cap);

        Ok(SourceBatch {
            records,
            malformed,
            notes: self.notes(profile, ctx),
        })
    }
}

/// Newer dates first, undated last.
fn newest_first(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn strip_html(html: &str) -> String {
    RE_TAG
        .replace_all(html, " ")
        .replace("&amp;", "&")
        .replace("&nbsp;", " ")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
}

/// An explicit RFP marker, or a grant marker next to an action verb.
pub fn has_opportunity_signal(lower_text: &str) -> bool {
    let any = |terms: &[&str]| terms.iter().any(|t| contains_term(lower_text, t));
    any(RFP_MARKERS) || (any(GRANT_MARKERS) && any(ACTION_VERBS))
}

fn funder_from_title(title: &str) -> Option<String> {
    let cut = RE_FUNDER_MARKER.find(title)?.start();
    text_or_none(title.get(..cut)?).filter(|f| f.chars().count() <= 80)
}

/// The matched deadline as stored text. Month spellings like "Sept." are
/// shortened to the three-letter form so the text stays parseable.
fn deadline_text(matched: &str) -> Option<String> {
    if parse_loose_date(matched).is_some() {
        return Some(matched.to_string());
    }
    let split = matched.find(|c: char| !c.is_alphabetic())?;
    let (month, rest) = matched.split_at(split);
    let short = month.chars().take(3).collect::<String>();
    let rewritten = format!("{short} {}", rest.trim_start_matches('.').trim_start());
    parse_loose_date(&rewritten).map(|_| rewritten)
}

/// Dollar amounts stated in the text. "up to $X" yields only a maximum; a
/// single plain amount yields equal bounds; nothing stated yields nothing.
pub fn extract_amounts(text: &str) -> (Option<f64>, Option<f64>) {
    let found = RE_AMOUNT
        .captures_iter(text)
        .filter_map(|c| {
            let value = c.get(2)?.as_str().replace(',', "").parse::<f64>().ok()?;
            let scale = match c.get(3).map(|m| m.as_str().to_lowercase()) {
                Some(unit) if unit == "k" => 1_000.0,
                Some(_) => 1_000_000.0,
                None => 1.0,
            };
            Some((value * scale, c.get(1).is_some()))
        })
        .collect::<Vec<_>>();

    match found.as_slice() {
        [] => (None, None),
        [(max, true), ..] => (None, Some(*max)),
        [(a, _), (b, _), ..] => (Some(a.min(*b)), Some(a.max(*b))),
        [(v, false)] => (Some(*v), Some(*v)),
    }
}

fn eligibility_sentence(text: &str) -> Option<String> {
    text.split(". ")
        .find(|s| {
            let lower = s.to_lowercase();
            lower.contains("eligib") || lower.contains("501(c)") || lower.contains("nonprofit")
        })
        .and_then(|s| text_or_none(s.trim_end_matches('.')))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{load_sample, read_snapshot, to_golden};

    #[tokio::test]
    async fn golden_json_snapshot_test_news_feed() {
        let bundle = load_sample("news-feed");
        let connector = NewsFeedConnector::new("news-feed", bundle.captured_from_url.clone());
        let batch = connector
            .parse(&bundle.raw_body, &bundle.profile, &bundle.context())
            .unwrap();
        assert_eq!(to_golden(&batch), read_snapshot("news-feed"));
        assert_eq!(batch.malformed, 0);
        assert_eq!(batch.notes.api, "rss");
        assert_eq!(batch.notes.window, "45d");
    }

    #[tokio::test]
    async fn result_cap_is_applied_after_ranking() {
        let bundle = load_sample("news-feed");
        let connector = NewsFeedConnector::new("news-feed", bundle.captured_from_url.clone());
        let mut ctx = bundle.context();
        ctx.result_cap = 1;
        let batch = connector.parse(&bundle.raw_body, &bundle.profile, &ctx).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].funder, "City Foundation");
    }

    #[tokio::test]
    async fn garbage_payload_is_malformed() {
        let bundle = load_sample("news-feed");
        let connector = NewsFeedConnector::new("news-feed", "https://example.org/feed");
        let err = connector
            .parse(b"definitely not xml", &QueryProfile::default(), &bundle.context())
            .unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }

    #[test]
    fn opportunity_signal_requires_rfp_or_grant_plus_action() {
        assert!(has_opportunity_signal("rfp: community health worker training"));
        assert!(has_opportunity_signal("prairie fund seeks applicants for food security grants"));
        assert!(!has_opportunity_signal("riverbend trust names new executive director"));
        assert!(!has_opportunity_signal("foundation announces record grants total for 2025"));
    }

    #[test]
    fn amounts_come_only_from_explicit_dollar_figures() {
        assert_eq!(extract_amounts("Grants of up to $50,000 are available"), (None, Some(50_000.0)));
        assert_eq!(
            extract_amounts("Awards range from $25,000 to $75,000."),
            (Some(25_000.0), Some(75_000.0))
        );
        assert_eq!(extract_amounts("A $1.5 million pool"), (Some(1_500_000.0), Some(1_500_000.0)));
        assert_eq!(extract_amounts("Generous support available"), (None, None));
    }

    #[test]
    fn funder_is_the_title_prefix_before_the_verb() {
        assert_eq!(
            funder_from_title("Acme Trust Now Accepting Letters of Inquiry").as_deref(),
            Some("Acme Trust")
        );
        assert_eq!(funder_from_title("RFP: Community Health"), None);
    }

    #[test]
    fn funder_prefix_survives_case_folding_that_changes_byte_length() {
        assert_eq!(
            funder_from_title("Stiftung Straẞe Invites Proposals").as_deref(),
            Some("Stiftung Straẞe")
        );
        assert_eq!(
            funder_from_title("İstanbul Vakfı Seeks Youth Projects").as_deref(),
            Some("İstanbul Vakfı")
        );
    }

    #[test]
    fn abbreviated_month_deadlines_are_stored_parseable() {
        let captured = |text: &str| {
            RE_DEADLINE
                .captures(text)
                .and_then(|c| c.get(1))
                .and_then(|m| deadline_text(m.as_str()))
        };
        let sept = captured("Applications due by Sept. 5, 2026.").unwrap();
        assert_eq!(sept, "Sep 5, 2026");
        assert_eq!(parse_loose_date(&sept), NaiveDate::from_ymd_opt(2026, 9, 5));
        assert_eq!(
            captured("Deadline: Dec. 1, 2026").as_deref().and_then(parse_loose_date),
            NaiveDate::from_ymd_opt(2026, 12, 1)
        );
        assert_eq!(captured("Deadline: November 20, 2026").as_deref(), Some("November 20, 2026"));
        assert_eq!(captured("Proposals due 12/01/2026").as_deref(), Some("12/01/2026"));
    }
}
