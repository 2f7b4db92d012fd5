use crate::code::TestId;
use crate::record::TestRecord;
use crate::store::{Finalized, ResultStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use placement_api_types::InboxOutcome;

/// Keeps records in memory for the lifetime of the process.
/// DashMap entry guards give us the per-key atomicity.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<TestId, TestRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert(&self, record: TestRecord) -> anyhow::Result<()> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => anyhow::bail!("test {} already exists", record.id),
            Entry::Vacant(entry) => {
                entry.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &TestId) -> anyhow::Result<Option<TestRecord>> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }

    async fn code_in_use(&self, code: &str) -> anyhow::Result<bool> {
        Ok(self.records.iter().any(|entry| entry.test_code == code))
    }

    async fn mark_sent(&self, id: &TestId) -> anyhow::Result<bool> {
        match self.records.get_mut(id) {
            Some(mut entry) => {
                entry.emails_sent = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finalize(
        &self,
        id: &TestId,
        results: Vec<InboxOutcome>,
    ) -> anyhow::Result<Finalized> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("test {id} not found"))?;
        if let Some(existing) = &entry.results {
            return Ok(Finalized::AlreadySet(existing.clone()));
        }
        entry.results.replace(results.clone());
        Ok(Finalized::Written(results))
    }
}
