use crate::code::TestId;
use chrono::{DateTime, Utc};
use placement_api_types::{InboxOutcome, ReportV1Response};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

static EMAIL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+@\S+\.\S+$").unwrap());

/// A deliberately loose check: something, `@`, something, `.`, something,
/// with no whitespace anywhere.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_SHAPE.is_match(email)
}

/// Everything we know about a single deliverability test
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRecord {
    pub id: TestId,
    pub user_email: String,
    pub test_code: String,
    pub test_inboxes: Vec<String>,
    /// Initialized to false for every inbox. Nothing updates this
    /// after creation; it is carried as metadata only.
    pub delivery_status: BTreeMap<String, bool>,
    pub emails_sent: bool,
    pub results: Option<Vec<InboxOutcome>>,
    pub created_at: DateTime<Utc>,
}

impl TestRecord {
    pub fn new(id: TestId, user_email: String, test_code: String, test_inboxes: Vec<String>) -> Self {
        let delivery_status = test_inboxes
            .iter()
            .map(|inbox| (inbox.to_string(), false))
            .collect();
        Self {
            id,
            user_email,
            test_code,
            test_inboxes,
            delivery_status,
            emails_sent: false,
            results: None,
            created_at: Utc::now(),
        }
    }

    pub fn to_report(&self) -> ReportV1Response {
        ReportV1Response {
            test_id: self.id.to_string(),
            test_code: self.test_code.clone(),
            test_inboxes: self.test_inboxes.clone(),
            results: self.results.clone(),
        }
    }

    /// Returns true if `results` has exactly one entry per test inbox
    pub fn covers_inboxes(&self, results: &[InboxOutcome]) -> bool {
        let mut expected: Vec<&str> = self.test_inboxes.iter().map(|s| s.as_str()).collect();
        let mut actual: Vec<&str> = results.iter().map(|r| r.inbox.as_str()).collect();
        expected.sort_unstable();
        actual.sort_unstable();
        expected == actual
    }

    /// The outcome set recorded when nothing arrived within the budget
    pub fn timed_out_results(&self) -> Vec<InboxOutcome> {
        self.test_inboxes
            .iter()
            .map(InboxOutcome::not_received)
            .collect()
    }
}
