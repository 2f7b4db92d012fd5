//! Wire types for the placement check HTTP API.
//!
//! These are shared between `placementd` and `placement-api-client` so
//! that both sides agree on the JSON shapes. Field names are camelCase
//! on the wire.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Whether a copy of the test message was found in a given inbox
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
pub enum PlacementStatus {
    Received,
    #[serde(rename = "Not Received")]
    NotReceived,
}

impl std::fmt::Display for PlacementStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Received => fmt.write_str("Received"),
            Self::NotReceived => fmt.write_str("Not Received"),
        }
    }
}

/// The folder that the mailbox provider sorted the message into
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
pub enum Folder {
    Inbox,
    Promotions,
    Spam,
}

impl std::fmt::Display for Folder {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Inbox => fmt.write_str("Inbox"),
            Self::Promotions => fmt.write_str("Promotions"),
            Self::Spam => fmt.write_str("Spam"),
        }
    }
}

/// The outcome for a single test inbox
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, ToSchema)]
pub struct InboxOutcome {
    pub inbox: String,
    pub status: PlacementStatus,
    /// Always null when `status` is `Not Received`
    pub folder: Option<Folder>,
}

impl InboxOutcome {
    pub fn received(inbox: impl Into<String>, folder: Folder) -> Self {
        Self {
            inbox: inbox.into(),
            status: PlacementStatus::Received,
            folder: Some(folder),
        }
    }

    pub fn not_received(inbox: impl Into<String>) -> Self {
        Self {
            inbox: inbox.into(),
            status: PlacementStatus::NotReceived,
            folder: None,
        }
    }

    pub fn is_received(&self) -> bool {
        self.status == PlacementStatus::Received
    }
}

impl std::fmt::Display for InboxOutcome {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}: {}", self.inbox, self.status)?;
        if let Some(folder) = &self.folder {
            write!(fmt, " ({folder})")?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartTestV1Request {
    /// The address that will receive the final report.
    /// A missing value is treated the same as an invalid one.
    #[serde(default)]
    pub user_email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartTestV1Response {
    pub test_id: String,
    /// Embed this code in the subject or body of the test message
    pub test_code: String,
    /// Send the test message to each of these addresses
    pub test_inboxes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct ConfirmTestV1Response {
    pub success: bool,
}

/// Returned by both the check and report endpoints
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReportV1Response {
    pub test_id: String,
    pub test_code: String,
    pub test_inboxes: Vec<String>,
    /// null until a check has completed
    pub results: Option<Vec<InboxOutcome>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CheckV1Params {
    /// When false, start the check in the background and return
    /// its status immediately instead of waiting for the results
    #[serde(default = "default_true")]
    pub wait: bool,
}

impl Default for CheckV1Params {
    fn default() -> Self {
        Self { wait: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    /// No check has been started and no results are recorded
    Idle,
    /// A background check is running
    Polling,
    /// Results have been recorded
    Finished,
    /// The most recent check ended with an error; it may be retried
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatusV1Response {
    pub test_id: String,
    pub state: CheckState,
    /// Number of detector invocations made by the running check
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<InboxOutcome>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, ToSchema)]
pub struct SetDiagnosticFilterRequest {
    /// An `EnvFilter` directive, eg: `placementd=debug`
    pub filter: String,
}
