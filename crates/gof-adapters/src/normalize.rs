//! Raw source record to canonical `Opportunity`.

use chrono::{DateTime, Utc};
use gof_core::{
    parse_loose_date, stable_key, Opportunity, RawOpportunity, SourceNotes, SubjectVocabulary,
};
use thiserror::Error;
use uuid::Uuid;

use crate::text_or_none;

/// A record that lacks the identity fields every opportunity needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed record from {source_name}: {reason}")]
pub struct MalformedRecord {
    pub source_name: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    vocabulary: SubjectVocabulary,
}

impl Normalizer {
    pub fn new(vocabulary: SubjectVocabulary) -> Self {
        Self { vocabulary }
    }

    pub fn vocabulary(&self) -> &SubjectVocabulary {
        &self.vocabulary
    }

    /// Missing optional fields stay empty. Amounts and dates are never invented.
    pub fn normalize(
        &self,
        raw: &RawOpportunity,
        source_name: &str,
        notes: &SourceNotes,
        now: DateTime<Utc>,
    ) -> Result<Opportunity, MalformedRecord> {
        let malformed = |reason| MalformedRecord {
            source_name: source_name.to_string(),
            reason,
        };
        let title = text_or_none(&raw.title).ok_or_else(|| malformed("missing title"))?;
        let funder = text_or_none(&raw.funder).ok_or_else(|| malformed("missing funder"))?;

        let (amount_min, amount_max) = match (usable_amount(raw.amount_min), usable_amount(raw.amount_max)) {
            (Some(min), Some(max)) if min > max => (Some(max), Some(min)),
            bounds => bounds,
        };
        let deadline = raw.deadline.as_deref().and_then(parse_loose_date);
        let posted_date = raw.posted.as_deref().and_then(parse_loose_date);
        let source_url = raw.url.as_deref().and_then(text_or_none);
        let description = raw.description.as_deref().and_then(text_or_none);
        let eligibility_text = raw.eligibility.as_deref().and_then(text_or_none);

        let mut subject_codes = raw
            .subject_codes
            .iter()
            .filter_map(|c| text_or_none(c))
            .map(|c| c.to_uppercase())
            .collect::<std::collections::BTreeSet<_>>();
        if subject_codes.is_empty() {
            let text = [Some(&title), description.as_ref(), eligibility_text.as_ref()]
                .into_iter()
                .flatten()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            subject_codes = self.vocabulary.codes_for(&text);
        }

        Ok(Opportunity {
            id: Uuid::new_v4(),
            org_id: None,
            stable_key: stable_key(&title, &funder, source_url.as_deref(), deadline),
            title,
            funder,
            amount_min,
            amount_max,
            deadline,
            posted_date,
            geography: raw.geography.as_deref().and_then(text_or_none),
            eligibility_text,
            description,
            subject_codes,
            source_name: source_name.to_string(),
            source_url,
            source_notes: notes.clone(),
            discovered_at: now,
            last_updated_at: now,
            latest_score: None,
        })
    }
}

fn usable_amount(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw(title: &str, funder: &str) -> RawOpportunity {
        RawOpportunity {
            title: title.to_string(),
            funder: funder.to_string(),
            ..RawOpportunity::default()
        }
    }

    #[test]
    fn absent_amounts_and_dates_stay_absent() {
        let normalizer = Normalizer::default();
        let o = normalizer
            .normalize(&raw("Arts Grant", "Arts Council"), "news-feed", &SourceNotes::default(), Utc::now())
            .unwrap();
        assert_eq!(o.amount_min, None);
        assert_eq!(o.amount_max, None);
        assert_eq!(o.deadline, None);
        assert_eq!(o.posted_date, None);
        assert_eq!(o.source_url, None);
    }

    #[test]
    fn single_bound_is_not_filled_and_reversed_bounds_swap() {
        let normalizer = Normalizer::default();
        let mut only_max = raw("Grant", "Funder");
        only_max.amount_max = Some(50_000.0);
        let o = normalizer
            .normalize(&only_max, "news-feed", &SourceNotes::default(), Utc::now())
            .unwrap();
        assert_eq!((o.amount_min, o.amount_max), (None, Some(50_000.0)));

        let mut reversed = raw("Grant", "Funder");
        reversed.amount_min = Some(9_000.0);
        reversed.amount_max = Some(3_000.0);
        let o = normalizer
            .normalize(&reversed, "news-feed", &SourceNotes::default(), Utc::now())
            .unwrap();
        assert_eq!((o.amount_min, o.amount_max), (Some(3_000.0), Some(9_000.0)));
    }

    #[test]
    fn dates_parse_and_text_is_collapsed() {
        let normalizer = Normalizer::default();
        let mut r = raw("  Youth   Education Grant ", "City Foundation");
        r.deadline = Some("November 20, 2026".into());
        r.posted = Some("garbled".into());
        r.url = Some("   ".into());
        let o = normalizer
            .normalize(&r, "news-feed", &SourceNotes::default(), Utc::now())
            .unwrap();
        assert_eq!(o.title, "Youth Education Grant");
        assert_eq!(o.deadline, NaiveDate::from_ymd_opt(2026, 11, 20));
        assert_eq!(o.posted_date, None);
        assert_eq!(o.source_url, None);
        assert_eq!(
            o.stable_key,
            stable_key("youth education grant", "city foundation", None, o.deadline)
        );
    }

    #[test]
    fn subject_codes_fall_back_to_vocabulary() {
        let normalizer = Normalizer::default();
        let o = normalizer
            .normalize(&raw("Youth Education Grant", "City Foundation"), "news-feed", &SourceNotes::default(), Utc::now())
            .unwrap();
        assert!(o.subject_codes.contains("B"));
        assert!(o.subject_codes.contains("O"));

        let mut coded = raw("Youth Education Grant", "City Foundation");
        coded.subject_codes = vec![" e ".into()];
        let o = normalizer
            .normalize(&coded, "foundation-transactions", &SourceNotes::default(), Utc::now())
            .unwrap();
        assert_eq!(o.subject_codes.into_iter().collect::<Vec<_>>(), vec!["E"]);
    }

    #[test]
    fn missing_funder_is_malformed() {
        let err = Normalizer::default()
            .normalize(&raw("Grant", "   "), "news-feed", &SourceNotes::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err.reason, "missing funder");
    }
}
