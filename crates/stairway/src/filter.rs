//! Flight listing: boolean-expression filters and page tokens
//!
//! Listing flights supports filtering on the built-in columns (class name,
//! status, creation window) plus an arbitrary boolean-expression predicate
//! tree over the flight's input parameters, realized by journal backends as
//! `EXISTS` subqueries against the input rows.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::FlightStatus;

/// A boolean-expression predicate over a flight's input parameters.
///
/// `Exists` matches any flight that has the named input key at all,
/// regardless of value — the building block a journal backend lowers to an
/// `EXISTS (SELECT 1 FROM flight_input WHERE ...)` subquery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InputPredicate {
    Exists { key: String },
    Eq { key: String, value: String },
    NotEq { key: String, value: String },
    Lt { key: String, value: String },
    Le { key: String, value: String },
    Gt { key: String, value: String },
    Ge { key: String, value: String },
    /// Matches if the stored value is one of `values` — the `list`/`IN` form.
    In { key: String, values: Vec<String> },
    Contains { key: String, substring: String },
    And(Vec<InputPredicate>),
    Or(Vec<InputPredicate>),
    Not(Box<InputPredicate>),
}

impl InputPredicate {
    pub fn and(predicates: impl IntoIterator<Item = InputPredicate>) -> Self {
        Self::And(predicates.into_iter().collect())
    }

    pub fn or(predicates: impl IntoIterator<Item = InputPredicate>) -> Self {
        Self::Or(predicates.into_iter().collect())
    }

    pub fn not(predicate: InputPredicate) -> Self {
        Self::Not(Box::new(predicate))
    }

    /// In-memory evaluation against a raw input map, used by
    /// [`crate::journal::InMemoryJournal`].
    pub fn matches(&self, input: &std::collections::BTreeMap<String, String>) -> bool {
        match self {
            Self::Exists { key } => input.contains_key(key),
            Self::Eq { key, value } => input.get(key).is_some_and(|v| v == value),
            Self::NotEq { key, value } => input.get(key).is_none_or(|v| v != value),
            Self::Lt { key, value } => input
                .get(key)
                .is_some_and(|v| compare_values(v, value) == std::cmp::Ordering::Less),
            Self::Le { key, value } => input
                .get(key)
                .is_some_and(|v| compare_values(v, value) != std::cmp::Ordering::Greater),
            Self::Gt { key, value } => input
                .get(key)
                .is_some_and(|v| compare_values(v, value) == std::cmp::Ordering::Greater),
            Self::Ge { key, value } => input
                .get(key)
                .is_some_and(|v| compare_values(v, value) != std::cmp::Ordering::Less),
            Self::In { key, values } => {
                input.get(key).is_some_and(|v| values.iter().any(|candidate| candidate == v))
            }
            Self::Contains { key, substring } => {
                input.get(key).is_some_and(|v| v.contains(substring.as_str()))
            }
            Self::And(predicates) => predicates.iter().all(|p| p.matches(input)),
            Self::Or(predicates) => predicates.iter().any(|p| p.matches(input)),
            Self::Not(inner) => !inner.matches(input),
        }
    }
}

/// Compares two stored values as RFC 3339 timestamps if both parse that way,
/// else falls back to lexicographic string comparison. Mirrors how a journal
/// backend must pick a SQL cast for the same ordering predicate (§4.9).
fn compare_values(raw: &str, rhs: &str) -> std::cmp::Ordering {
    match (
        DateTime::parse_from_rfc3339(raw),
        DateTime::parse_from_rfc3339(rhs),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => raw.cmp(rhs),
    }
}

/// Criteria for listing flights.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlightFilter {
    pub class_name: Option<String>,
    pub statuses: Vec<FlightStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub input_predicate: Option<InputPredicate>,
}

impl FlightFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn with_status(mut self, status: FlightStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_input_predicate(mut self, predicate: InputPredicate) -> Self {
        self.input_predicate = Some(predicate);
        self
    }

    pub fn matches_class(&self, class_name: &str) -> bool {
        self.class_name.as_deref().is_none_or(|c| c == class_name)
    }

    pub fn matches_status(&self, status: FlightStatus) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&status)
    }

    pub fn matches_created(&self, created_at: DateTime<Utc>) -> bool {
        self.created_after.is_none_or(|after| created_at >= after)
            && self.created_before.is_none_or(|before| created_at <= before)
    }
}

/// Opaque pagination cursor. Encodes the sort key of the last row returned
/// (creation timestamp, flight id) so a subsequent page can resume with a
/// `WHERE (created_at, flight_id) > (...)` predicate instead of an `OFFSET`.
///
/// `last_flight_id` is `None` when the cursor was minted from an empty page
/// rather than a real row (§4.9: "if no rows are returned, the token carries
/// the server's current time so repeated polling makes forward progress") —
/// there is no row to tie-break on, only a time bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    pub last_created_at: DateTime<Utc>,
    pub last_flight_id: Option<String>,
}

impl PageToken {
    /// A cursor minted when a page came back empty: carries only the
    /// server's current time, so the next poll advances past it without a
    /// row to anchor on.
    pub fn now_empty(now: DateTime<Utc>) -> Self {
        Self {
            last_created_at: now,
            last_flight_id: None,
        }
    }

    /// Whether `(created_at, flight_id)` sorts strictly after this cursor.
    /// With no `last_flight_id` (an empty-page cursor), only the timestamp
    /// bound applies.
    pub fn is_after(&self, created_at: DateTime<Utc>, flight_id: &str) -> bool {
        match &self.last_flight_id {
            Some(last_id) => (created_at, flight_id) > (self.last_created_at, last_id.as_str()),
            None => created_at > self.last_created_at,
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("PageToken always serializes");
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self, PageTokenError> {
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| PageTokenError(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| PageTokenError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid page token: {0}")]
pub struct PageTokenError(String);

/// Page size plus an optional cursor into a previous result set.
#[derive(Debug, Clone)]
pub struct Pagination {
    pub page_size: u32,
    pub after: Option<PageToken>,
}

impl Pagination {
    pub fn first_page(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            after: None,
        }
    }

    pub fn next(page_size: u32, after: PageToken) -> Self {
        Self {
            page_size: page_size.max(1),
            after: Some(after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn input(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exists_matches_presence_only() {
        let predicate = InputPredicate::Exists {
            key: "customer_id".to_string(),
        };
        assert!(predicate.matches(&input(&[("customer_id", "123")])));
        assert!(!predicate.matches(&input(&[("other", "x")])));
    }

    #[test]
    fn and_or_not_compose() {
        let predicate = InputPredicate::and([
            InputPredicate::Eq {
                key: "region".to_string(),
                value: "us".to_string(),
            },
            InputPredicate::or([
                InputPredicate::Eq {
                    key: "tier".to_string(),
                    value: "gold".to_string(),
                },
                InputPredicate::not(InputPredicate::Exists {
                    key: "trial".to_string(),
                }),
            ]),
        ]);

        assert!(predicate.matches(&input(&[("region", "us"), ("tier", "gold")])));
        assert!(predicate.matches(&input(&[("region", "us")])));
        assert!(!predicate.matches(&input(&[("region", "eu")])));
    }

    #[test]
    fn page_token_round_trips() {
        let token = PageToken {
            last_created_at: Utc::now(),
            last_flight_id: Some("f-42".to_string()),
        };
        let encoded = token.encode();
        let decoded = PageToken::decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn page_token_rejects_garbage() {
        assert!(PageToken::decode("not-a-token").is_err());
    }

    #[test]
    fn empty_page_token_carries_only_a_time_bound() {
        let now = Utc::now();
        let token = PageToken::now_empty(now);
        assert!(token.is_after(now + chrono::Duration::seconds(1), "anything"));
        assert!(!token.is_after(now, "anything"));
    }

    #[test]
    fn page_token_with_flight_id_tie_breaks_on_id() {
        let token = PageToken {
            last_created_at: Utc::now(),
            last_flight_id: Some("f-5".to_string()),
        };
        assert!(token.is_after(token.last_created_at, "f-6"));
        assert!(!token.is_after(token.last_created_at, "f-4"));
    }

    #[test]
    fn ordering_operators_compare_lexicographically_for_non_timestamps() {
        let rows = input(&[("amount", "42")]);
        assert!(InputPredicate::Lt { key: "amount".to_string(), value: "9".to_string() }.matches(&rows));
        assert!(InputPredicate::Ge { key: "amount".to_string(), value: "42".to_string() }.matches(&rows));
        assert!(!InputPredicate::Gt { key: "amount".to_string(), value: "9".to_string() }.matches(&rows));
    }

    #[test]
    fn ordering_operators_compare_chronologically_for_timestamps() {
        let rows = input(&[("created", "2024-06-01T00:00:00Z")]);
        assert!(InputPredicate::Lt {
            key: "created".to_string(),
            value: "2025-01-01T00:00:00Z".to_string(),
        }
        .matches(&rows));
        assert!(!InputPredicate::Gt {
            key: "created".to_string(),
            value: "2025-01-01T00:00:00Z".to_string(),
        }
        .matches(&rows));
    }

    #[test]
    fn in_matches_any_listed_value() {
        let rows = input(&[("tier", "gold")]);
        let predicate = InputPredicate::In {
            key: "tier".to_string(),
            values: vec!["silver".to_string(), "gold".to_string()],
        };
        assert!(predicate.matches(&rows));
        assert!(!InputPredicate::In {
            key: "tier".to_string(),
            values: vec!["silver".to_string()],
        }
        .matches(&rows));
    }

    #[test]
    fn filter_matches_class_and_status() {
        let filter = FlightFilter::new()
            .with_class_name("OrderFlight")
            .with_status(FlightStatus::Running);
        assert!(filter.matches_class("OrderFlight"));
        assert!(!filter.matches_class("OtherFlight"));
        assert!(filter.matches_status(FlightStatus::Running));
        assert!(!filter.matches_status(FlightStatus::Success));
    }
}
