use crate::code::TestId;
use crate::record::TestRecord;
use crate::store::{Finalized, ResultStore};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use placement_api_types::InboxOutcome;
use sqlite::{Connection, State, Statement};
use std::sync::Arc;
use tokio::task::spawn_blocking;

/// Durable storage for test records, backed by a sqlite database file.
/// Each record is a single row keyed by its id; list-valued fields are
/// stored as json text.
///
/// `change_count` reports on the most recent statement run on the
/// connection, so statements are run one at a time under a lock.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Carry out the blocking operation on the database object
    async fn perform<T: Send + 'static>(
        &self,
        func: impl FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let db = self.db.clone();
        spawn_blocking(move || {
            let db = db.lock();
            (func)(&db)
        })
        .await?
    }

    pub fn open(path: &str) -> anyhow::Result<Self> {
        let mut db = Connection::open(path)
            .with_context(|| format!("failed to open placement database {path}"))?;

        db.set_busy_timeout(60_000)?;

        let query = r#"
CREATE TABLE IF NOT EXISTS tests (
    id text PRIMARY KEY,
    user_email text NOT NULL,
    test_code text NOT NULL UNIQUE,
    test_inboxes text NOT NULL,
    delivery_status text NOT NULL,
    emails_sent int NOT NULL DEFAULT 0,
    results text,
    created_at text NOT NULL
);
    "#;

        db.execute(query)?;

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

fn read_record(stmt: &Statement) -> anyhow::Result<TestRecord> {
    let id: String = stmt.read("id")?;
    let test_inboxes: String = stmt.read("test_inboxes")?;
    let delivery_status: String = stmt.read("delivery_status")?;
    let emails_sent: i64 = stmt.read("emails_sent")?;
    let results: Option<String> = stmt.read("results")?;
    let created_at: String = stmt.read("created_at")?;

    Ok(TestRecord {
        id: id.parse().with_context(|| format!("invalid test id {id}"))?,
        user_email: stmt.read("user_email")?,
        test_code: stmt.read("test_code")?,
        test_inboxes: serde_json::from_str(&test_inboxes)
            .with_context(|| format!("parsing test_inboxes of {id}"))?,
        delivery_status: serde_json::from_str(&delivery_status)
            .with_context(|| format!("parsing delivery_status of {id}"))?,
        emails_sent: emails_sent != 0,
        results: results
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .with_context(|| format!("parsing results of {id}"))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .with_context(|| format!("parsing created_at of {id}"))?
            .with_timezone(&Utc),
    })
}

fn select_record(db: &Connection, id: &str) -> anyhow::Result<Option<TestRecord>> {
    let mut stmt = db.prepare("SELECT * FROM tests WHERE id = :id")?;
    stmt.bind((":id", id))?;
    if stmt.next()? == State::Row {
        Ok(Some(read_record(&stmt)?))
    } else {
        Ok(None)
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn insert(&self, record: TestRecord) -> anyhow::Result<()> {
        let test_inboxes = serde_json::to_string(&record.test_inboxes)?;
        let delivery_status = serde_json::to_string(&record.delivery_status)?;
        let results = record
            .results
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let id = record.id.to_string();
        let created_at = record.created_at.to_rfc3339();

        self.perform(move |db| {
            let mut stmt = db.prepare(
                "INSERT INTO tests (id, user_email, test_code, test_inboxes, \
                 delivery_status, emails_sent, results, created_at) \
                 VALUES (:id, :user_email, :test_code, :test_inboxes, \
                 :delivery_status, :emails_sent, :results, :created_at)",
            )?;
            stmt.bind((":id", id.as_str()))?;
            stmt.bind((":user_email", record.user_email.as_str()))?;
            stmt.bind((":test_code", record.test_code.as_str()))?;
            stmt.bind((":test_inboxes", test_inboxes.as_str()))?;
            stmt.bind((":delivery_status", delivery_status.as_str()))?;
            stmt.bind((":emails_sent", record.emails_sent as i64))?;
            stmt.bind((":results", results.as_deref()))?;
            stmt.bind((":created_at", created_at.as_str()))?;
            stmt.next()
                .with_context(|| format!("inserting test {id}"))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &TestId) -> anyhow::Result<Option<TestRecord>> {
        let id = id.to_string();
        self.perform(move |db| select_record(db, &id)).await
    }

    async fn code_in_use(&self, code: &str) -> anyhow::Result<bool> {
        let code = code.to_string();
        self.perform(move |db| {
            let mut stmt = db.prepare("SELECT count(*) FROM tests WHERE test_code = :code")?;
            stmt.bind((":code", code.as_str()))?;
            stmt.next()?;
            let count: i64 = stmt.read(0)?;
            Ok(count > 0)
        })
        .await
    }

    async fn mark_sent(&self, id: &TestId) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.perform(move |db| {
            let mut stmt = db.prepare("UPDATE tests SET emails_sent = 1 WHERE id = :id")?;
            stmt.bind((":id", id.as_str()))?;
            stmt.next()?;
            Ok(db.change_count() > 0)
        })
        .await
    }

    async fn finalize(
        &self,
        id: &TestId,
        results: Vec<InboxOutcome>,
    ) -> anyhow::Result<Finalized> {
        let encoded = serde_json::to_string(&results)?;
        let id = id.to_string();
        self.perform(move |db| {
            // The IS NULL guard makes this write-once even if
            // two writers race on the same record
            let mut stmt = db.prepare(
                "UPDATE tests SET results = :results WHERE id = :id AND results IS NULL",
            )?;
            stmt.bind((":results", encoded.as_str()))?;
            stmt.bind((":id", id.as_str()))?;
            stmt.next()?;
            if db.change_count() > 0 {
                return Ok(Finalized::Written(results));
            }

            let record =
                select_record(db, &id)?.ok_or_else(|| anyhow::anyhow!("test {id} not found"))?;
            let existing = record
                .results
                .ok_or_else(|| anyhow::anyhow!("test {id} results vanished during finalize"))?;
            Ok(Finalized::AlreadySet(existing))
        })
        .await
    }
}
