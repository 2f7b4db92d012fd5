//! Persistence for test records.
//!
//! Each method is atomic with respect to a single record; no operation
//! spans more than one key.
use crate::code::TestId;
use crate::record::TestRecord;
use async_trait::async_trait;
use placement_api_types::InboxOutcome;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// The outcome of attempting to record results for a test
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// These results were written by this call
    Written(Vec<InboxOutcome>),
    /// Results had already been recorded; they are returned unchanged
    /// and the results passed in were discarded
    AlreadySet(Vec<InboxOutcome>),
}

#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Persist a brand new record. Fails if the id is already present.
    async fn insert(&self, record: TestRecord) -> anyhow::Result<()>;

    async fn get(&self, id: &TestId) -> anyhow::Result<Option<TestRecord>>;

    /// Returns true if some record already uses this test code
    async fn code_in_use(&self, code: &str) -> anyhow::Result<bool>;

    /// Set `emails_sent`. Returns false if there is no such record.
    async fn mark_sent(&self, id: &TestId) -> anyhow::Result<bool>;

    /// Record results for a test, at most once.
    /// Errors if there is no such record.
    async fn finalize(&self, id: &TestId, results: Vec<InboxOutcome>)
        -> anyhow::Result<Finalized>;
}
