use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    /// The caller supplied something malformed, eg: a bad email address
    #[error("{0}")]
    Validation(String),
    /// Unknown test id, or a report that is not ready yet
    #[error("{0}")]
    NotFound(String),
    /// The operation is not permitted in the record's current state
    #[error("{0}")]
    Precondition(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TestError {
    pub fn invalid_email() -> Self {
        Self::Validation("Invalid email".to_string())
    }

    pub fn test_not_found() -> Self {
        Self::NotFound("Test not found".to_string())
    }

    pub fn report_not_ready() -> Self {
        Self::NotFound("Report not ready".to_string())
    }

    pub fn emails_not_sent() -> Self {
        Self::Precondition("Emails not sent yet".to_string())
    }
}
