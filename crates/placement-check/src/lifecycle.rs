//! The test lifecycle: creation, confirmation, the bounded polling
//! check and the finished report.
//!
//! A check runs as a background job owned by the manager rather than
//! by the request that asked for it. Jobs are keyed by test id; whoever
//! claims the map entry first starts the job and everyone else joins it
//! by subscribing to its state. That claim, together with the store's
//! write-once `finalize`, is what keeps finalization and notification
//! to at most once per test.
use crate::code::{generate_code, TestId};
use crate::detector::PlacementDetector;
use crate::error::TestError;
use crate::notifier::Notifier;
use crate::record::{is_valid_email, TestRecord};
use crate::store::{Finalized, ResultStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use placement_api_types::{CheckState, CheckStatusV1Response, InboxOutcome, ReportV1Response};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

pub const DEFAULT_TEST_INBOXES: &[&str] = &[
    "testinbox.gmass@gmail.com",
    "testspam.gmass@gmail.com",
    "testpromotions.gmass@gmail.com",
    "testdeliverability@outlook.com",
    "testemail@yahoo.com",
];

const MAX_CODE_ATTEMPTS: usize = 16;

/// When to send the report to the user
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NotifyPolicy {
    /// Only when the detector saw the message in at least one inbox
    #[default]
    OnDetection,
    /// Also when the check gave up and recorded everything as not received
    Always,
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub test_inboxes: Vec<String>,
    pub poll_interval: Duration,
    pub poll_budget: Duration,
    pub notify_policy: NotifyPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            test_inboxes: DEFAULT_TEST_INBOXES.iter().map(|s| s.to_string()).collect(),
            poll_interval: Duration::from_secs(30),
            poll_budget: Duration::from_secs(300),
            notify_policy: NotifyPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.test_inboxes.is_empty() {
            anyhow::bail!("at least one test inbox must be configured");
        }
        for (idx, inbox) in self.test_inboxes.iter().enumerate() {
            if !is_valid_email(inbox) {
                anyhow::bail!("test inbox {inbox:?} is not a valid email address");
            }
            if self.test_inboxes[..idx].contains(inbox) {
                anyhow::bail!("test inbox {inbox} is listed more than once");
            }
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
enum JobState {
    Polling {
        attempts: u32,
        started_at: DateTime<Utc>,
    },
    Finished(Vec<InboxOutcome>),
    Failed(String),
}

impl JobState {
    fn is_terminal(&self) -> bool {
        !matches!(self, Self::Polling { .. })
    }
}

struct Inner {
    config: ManagerConfig,
    store: Arc<dyn ResultStore>,
    detector: Arc<dyn PlacementDetector>,
    notifier: Arc<dyn Notifier>,
    jobs: DashMap<TestId, watch::Receiver<JobState>>,
    /// The error from the most recent failed job for a test,
    /// cleared when a new job starts
    failures: DashMap<TestId, String>,
    shutdown: watch::Sender<bool>,
}

/// Orchestrates the test lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TestManager {
    inner: Arc<Inner>,
}

impl TestManager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn ResultStore>,
        detector: Arc<dyn PlacementDetector>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                detector,
                notifier,
                jobs: DashMap::new(),
                failures: DashMap::new(),
                shutdown,
            }),
        })
    }

    pub fn test_inboxes(&self) -> &[String] {
        &self.inner.config.test_inboxes
    }

    /// Stop all running checks. They end in the failed state without
    /// recording any results, and no further checks can make progress.
    pub fn shutdown(&self) {
        tracing::info!(
            "stopping {} running placement checks",
            self.inner.jobs.len()
        );
        self.inner.shutdown.send_replace(true);
    }

    async fn load(&self, id: &TestId) -> Result<TestRecord, TestError> {
        self.inner
            .store
            .get(id)
            .await
            .with_context(|| format!("loading test {id}"))?
            .ok_or_else(TestError::test_not_found)
    }

    async fn allocate_code(&self) -> anyhow::Result<String> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(&mut rand::thread_rng());
            if !self.inner.store.code_in_use(&code).await? {
                return Ok(code);
            }
            tracing::debug!("test code {code} is already in use, picking another");
        }
        anyhow::bail!("unable to allocate an unused test code after {MAX_CODE_ATTEMPTS} attempts")
    }

    /// Create a new test for `user_email`
    pub async fn start_test(&self, user_email: &str) -> Result<TestRecord, TestError> {
        if !is_valid_email(user_email) {
            return Err(TestError::invalid_email());
        }

        let test_code = self.allocate_code().await?;
        let record = TestRecord::new(
            TestId::generate(),
            user_email.to_string(),
            test_code,
            self.inner.config.test_inboxes.clone(),
        );
        self.inner
            .store
            .insert(record.clone())
            .await
            .with_context(|| format!("saving test {}", record.id))?;

        tracing::info!(
            "started test {} with code {} for {user_email}",
            record.id,
            record.test_code
        );
        Ok(record)
    }

    /// Record that the user has sent their message to the test inboxes.
    /// Calling this more than once is harmless.
    pub async fn confirm_sent(&self, id: &TestId) -> Result<(), TestError> {
        let found = self
            .inner
            .store
            .mark_sent(id)
            .await
            .with_context(|| format!("confirming test {id}"))?;
        if !found {
            return Err(TestError::test_not_found());
        }
        tracing::debug!("test {id} confirmed as sent");
        Ok(())
    }

    async fn load_checkable(&self, id: &TestId) -> Result<TestRecord, TestError> {
        let record = self.load(id).await?;
        if !record.emails_sent {
            return Err(TestError::emails_not_sent());
        }
        Ok(record)
    }

    /// Check the placement of the test message, polling the detector
    /// until it sees the message or the poll budget runs out.
    /// Once results are recorded they are returned as-is by every
    /// subsequent call.
    pub async fn check_test(&self, id: &TestId) -> Result<ReportV1Response, TestError> {
        let record = self.load_checkable(id).await?;
        if record.results.is_some() {
            return Ok(record.to_report());
        }

        let mut rx = self.claim_job(&record);
        let state = match rx.wait_for(JobState::is_terminal).await {
            Ok(state) => JobState::clone(&state),
            Err(_) => {
                return Err(anyhow::anyhow!("check for test {id} was abandoned").into());
            }
        };

        match state {
            JobState::Finished(results) => Ok(ReportV1Response {
                results: Some(results),
                ..record.to_report()
            }),
            JobState::Failed(err) => Err(TestError::Internal(anyhow::anyhow!(err))),
            JobState::Polling { .. } => Err(TestError::Internal(anyhow::anyhow!(
                "check for test {id} is still polling"
            ))),
        }
    }

    /// Like `check_test`, but returns as soon as the check is running
    pub async fn begin_check(&self, id: &TestId) -> Result<CheckStatusV1Response, TestError> {
        let record = self.load_checkable(id).await?;
        if record.results.is_none() {
            self.claim_job(&record);
        }
        Ok(self.status_for(&record))
    }

    /// Report on the progress of a check without starting one
    pub async fn check_status(&self, id: &TestId) -> Result<CheckStatusV1Response, TestError> {
        let record = self.load(id).await?;
        Ok(self.status_for(&record))
    }

    fn status_for(&self, record: &TestRecord) -> CheckStatusV1Response {
        let mut status = CheckStatusV1Response {
            test_id: record.id.to_string(),
            state: CheckState::Idle,
            attempts: 0,
            started_at: None,
            results: None,
            error: None,
        };

        if let Some(results) = &record.results {
            status.state = CheckState::Finished;
            status.results.replace(results.clone());
            return status;
        }

        let job_state = self
            .inner
            .jobs
            .get(&record.id)
            .map(|rx| JobState::clone(&rx.borrow()));
        match job_state {
            Some(JobState::Polling {
                attempts,
                started_at,
            }) => {
                status.state = CheckState::Polling;
                status.attempts = attempts;
                status.started_at.replace(started_at);
            }
            Some(JobState::Finished(results)) => {
                status.state = CheckState::Finished;
                status.results.replace(results);
            }
            Some(JobState::Failed(err)) => {
                status.state = CheckState::Failed;
                status.error.replace(err);
            }
            None => {
                if let Some(err) = self.inner.failures.get(&record.id) {
                    status.state = CheckState::Failed;
                    status.error.replace(err.value().clone());
                }
            }
        }
        status
    }

    /// Fetch the report for a confirmed test. Unconfirmed tests
    /// are indistinguishable from unknown ones here.
    pub async fn get_report(&self, id: &TestId) -> Result<ReportV1Response, TestError> {
        let record = self
            .inner
            .store
            .get(id)
            .await
            .with_context(|| format!("loading test {id}"))?;
        match record {
            Some(record) if record.emails_sent => Ok(record.to_report()),
            _ => Err(TestError::report_not_ready()),
        }
    }

    /// Join the running job for this test, or start one
    fn claim_job(&self, record: &TestRecord) -> watch::Receiver<JobState> {
        let (tx, rx) = match self.inner.jobs.entry(record.id) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(JobState::Polling {
                    attempts: 0,
                    started_at: Utc::now(),
                });
                entry.insert(rx.clone());
                (tx, rx)
            }
        };
        self.inner.failures.remove(&record.id);

        let inner = self.inner.clone();
        let record = record.clone();
        let span = tracing::info_span!(
            "placement_check",
            test_id = %record.id,
            test_code = %record.test_code
        );
        tokio::spawn(async move { inner.run_job(record, tx).await }.instrument(span));
        rx
    }
}

/// Owns the publishing side of a job. When the job ends without
/// publishing a terminal state, eg: because the detector panicked or
/// the task was cancelled, dropping this marks the job as failed.
/// Either way the job's slot is released so that it can be retried.
struct JobSlot {
    inner: Arc<Inner>,
    id: TestId,
    tx: watch::Sender<JobState>,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        let terminal = self.tx.borrow().is_terminal();
        if !terminal {
            let err = "placement check was aborted".to_string();
            tracing::error!("placement check for {} was aborted", self.id);
            self.inner.failures.insert(self.id, err.clone());
            self.tx.send_replace(JobState::Failed(err));
        }
        // Publish before removing so that anyone who joins in between
        // sees the terminal state rather than starting over
        self.inner.jobs.remove(&self.id);
    }
}

impl Inner {
    async fn run_job(self: Arc<Self>, record: TestRecord, tx: watch::Sender<JobState>) {
        let slot = JobSlot {
            inner: self.clone(),
            id: record.id,
            tx,
        };
        let state = match self.poll_and_finalize(&record, &slot.tx).await {
            Ok(results) => JobState::Finished(results),
            Err(err) => {
                let err = format!("{err:#}");
                tracing::error!("placement check for {} failed: {err}", record.id);
                self.failures.insert(record.id, err.clone());
                JobState::Failed(err)
            }
        };
        slot.tx.send_replace(state);
    }

    async fn poll_and_finalize(
        &self,
        record: &TestRecord,
        tx: &watch::Sender<JobState>,
    ) -> anyhow::Result<Vec<InboxOutcome>> {
        // A previous job may have finished between our caller
        // reading the record and claiming this job
        if let Some(results) = self
            .store
            .get(&record.id)
            .await?
            .and_then(|current| current.results)
        {
            return Ok(results);
        }

        let mut shutdown = self.shutdown.subscribe();
        let deadline = Instant::now() + self.config.poll_budget;
        let mut attempts = 0u32;

        let detected = loop {
            if Instant::now() >= deadline {
                break None;
            }
            if *shutdown.borrow() {
                anyhow::bail!("shutting down");
            }

            attempts += 1;
            let detect = self.detector.detect(&record.test_code, &record.test_inboxes);
            let results = match tokio::time::timeout_at(deadline, detect).await {
                Ok(results) => results
                    .with_context(|| format!("detecting placement for {}", record.test_code))?,
                Err(_) => break None,
            };
            if !record.covers_inboxes(&results) {
                anyhow::bail!(
                    "detector returned outcomes for {:?} but the test inboxes are {:?}",
                    results.iter().map(|r| &r.inbox).collect::<Vec<_>>(),
                    record.test_inboxes
                );
            }
            tx.send_modify(|state| {
                if let JobState::Polling { attempts: a, .. } = state {
                    *a = attempts;
                }
            });

            if results.iter().any(InboxOutcome::is_received) {
                tracing::debug!("message seen after {attempts} attempts");
                break Some(results);
            }

            let next_poll = (Instant::now() + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(next_poll) => {}
                _ = shutdown.changed() => {
                    anyhow::bail!("shutting down");
                }
            }
        };

        let (results, detected) = match detected {
            Some(results) => (results, true),
            None => {
                tracing::info!(
                    "test {} not seen in any inbox after {attempts} attempts, giving up",
                    record.test_code
                );
                (record.timed_out_results(), false)
            }
        };

        match self
            .store
            .finalize(&record.id, results)
            .await
            .with_context(|| format!("saving results for test {}", record.id))?
        {
            Finalized::Written(results) => {
                if detected || self.config.notify_policy == NotifyPolicy::Always {
                    self.spawn_notify(record, results.clone());
                }
                Ok(results)
            }
            Finalized::AlreadySet(existing) => Ok(existing),
        }
    }

    fn spawn_notify(&self, record: &TestRecord, results: Vec<InboxOutcome>) {
        let notifier = self.notifier.clone();
        let user_email = record.user_email.clone();
        let test_code = record.test_code.clone();
        tokio::spawn(
            async move {
                if let Err(err) = notifier.notify(&user_email, &test_code, &results).await {
                    tracing::error!("Failed to send report for {test_code} to {user_email}: {err:#}");
                }
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notifier::LogNotifier;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use placement_api_types::{Folder, PlacementStatus};
    use regex::Regex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Replays canned outcome sets, then reports nothing received forever
    #[derive(Default)]
    struct ScriptedDetector {
        script: Mutex<VecDeque<anyhow::Result<Vec<InboxOutcome>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedDetector {
        fn with_script(script: Vec<anyhow::Result<Vec<InboxOutcome>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PlacementDetector for ScriptedDetector {
        async fn detect(
            &self,
            _test_code: &str,
            inboxes: &[String],
        ) -> anyhow::Result<Vec<InboxOutcome>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(result) => result,
                None => Ok(inboxes.iter().map(InboxOutcome::not_received).collect()),
            }
        }
    }

    type Notification = (String, String, Vec<InboxOutcome>);

    struct ChannelNotifier {
        tx: UnboundedSender<Notification>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(
            &self,
            user_email: &str,
            test_code: &str,
            results: &[InboxOutcome],
        ) -> anyhow::Result<()> {
            self.tx
                .send((user_email.to_string(), test_code.to_string(), results.to_vec()))
                .ok();
            if self.fail {
                anyhow::bail!("smtp server on fire");
            }
            Ok(())
        }
    }

    struct Harness {
        manager: TestManager,
        detector: Arc<ScriptedDetector>,
        notifications: UnboundedReceiver<Notification>,
    }

    impl Harness {
        fn new(script: Vec<anyhow::Result<Vec<InboxOutcome>>>) -> Self {
            Self::with_config(script, ManagerConfig::default(), false)
        }

        fn with_config(
            script: Vec<anyhow::Result<Vec<InboxOutcome>>>,
            config: ManagerConfig,
            notifier_fails: bool,
        ) -> Self {
            let detector = ScriptedDetector::with_script(script);
            let (tx, notifications) = unbounded_channel();
            let manager = TestManager::new(
                config,
                Arc::new(MemoryStore::new()),
                detector.clone(),
                Arc::new(ChannelNotifier {
                    tx,
                    fail: notifier_fails,
                }),
            )
            .unwrap();
            Self {
                manager,
                detector,
                notifications,
            }
        }

        async fn confirmed_test(&self) -> TestRecord {
            let record = self.manager.start_test("a@b.com").await.unwrap();
            self.manager.confirm_sent(&record.id).await.unwrap();
            record
        }

        /// Wait for the next notification; time auto-advances when paused
        async fn next_notification(&mut self) -> Notification {
            tokio::time::timeout(Duration::from_secs(5), self.notifications.recv())
                .await
                .expect("notification arrives")
                .expect("channel is open")
        }

        /// Give spawned notification tasks a chance to run, then make
        /// sure that none were sent
        async fn assert_no_notification(&mut self) {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(self.notifications.try_recv().is_err());
        }
    }

    fn one_received() -> Vec<InboxOutcome> {
        DEFAULT_TEST_INBOXES
            .iter()
            .enumerate()
            .map(|(idx, inbox)| {
                if idx == 2 {
                    InboxOutcome::received(*inbox, Folder::Promotions)
                } else {
                    InboxOutcome::not_received(*inbox)
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn start_test() {
        let harness = Harness::new(vec![]);
        let record = harness.manager.start_test("a@b.com").await.unwrap();
        k9::assert_equal!(record.test_inboxes, ManagerConfig::default().test_inboxes);
        k9::assert_equal!(record.user_email, "a@b.com");
        assert!(!record.emails_sent);
        assert!(record.results.is_none());
        let re = Regex::new(r"^[a-z]+-[a-z]+-\d{4}$").unwrap();
        assert!(re.is_match(&record.test_code), "{}", record.test_code);

        let other = harness.manager.start_test("c@d.org").await.unwrap();
        assert_ne!(record.id, other.id);
        assert_ne!(record.test_code, other.test_code);
    }

    #[tokio::test]
    async fn start_test_rejects_bad_email() {
        let harness = Harness::new(vec![]);
        for bad in ["", "ab.com", "a@bcom", "a @b.com"] {
            match harness.manager.start_test(bad).await {
                Err(TestError::Validation(msg)) => {
                    k9::assert_equal!(msg, "Invalid email");
                }
                other => panic!("expected validation error for {bad:?}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn confirm() {
        let harness = Harness::new(vec![]);
        let record = harness.manager.start_test("a@b.com").await.unwrap();
        harness.manager.confirm_sent(&record.id).await.unwrap();
        harness.manager.confirm_sent(&record.id).await.unwrap();
        assert!(matches!(
            harness.manager.confirm_sent(&TestId::generate()).await,
            Err(TestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn check_requires_confirmation() {
        let harness = Harness::new(vec![Ok(one_received())]);
        let record = harness.manager.start_test("a@b.com").await.unwrap();
        match harness.manager.check_test(&record.id).await {
            Err(TestError::Precondition(msg)) => {
                k9::assert_equal!(msg, "Emails not sent yet");
            }
            other => panic!("expected precondition error, got {other:?}"),
        }
        assert!(matches!(
            harness.manager.begin_check(&record.id).await,
            Err(TestError::Precondition(_))
        ));
        k9::assert_equal!(harness.detector.calls(), 0);

        assert!(matches!(
            harness.manager.check_test(&TestId::generate()).await,
            Err(TestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn detected_on_first_poll() {
        let mut harness = Harness::new(vec![Ok(one_received())]);
        let record = harness.confirmed_test().await;

        let report = harness.manager.check_test(&record.id).await.unwrap();
        k9::assert_equal!(report.test_id, record.id.to_string());
        k9::assert_equal!(report.test_code, record.test_code);
        k9::assert_equal!(report.results, Some(one_received()));
        k9::assert_equal!(harness.detector.calls(), 1);

        let (email, code, results) = harness.next_notification().await;
        k9::assert_equal!(email, "a@b.com");
        k9::assert_equal!(code, record.test_code);
        k9::assert_equal!(results, one_received());

        // Cached from here on
        let again = harness.manager.check_test(&record.id).await.unwrap();
        k9::assert_equal!(again, report);
        k9::assert_equal!(harness.detector.calls(), 1);
        harness.assert_no_notification().await;

        let stored = harness.manager.get_report(&record.id).await.unwrap();
        k9::assert_equal!(stored, report);
    }

    #[tokio::test(start_paused = true)]
    async fn detected_after_a_few_polls() {
        let nothing: Vec<InboxOutcome> = DEFAULT_TEST_INBOXES
            .iter()
            .map(|inbox| InboxOutcome::not_received(*inbox))
            .collect();
        let mut harness = Harness::new(vec![
            Ok(nothing.clone()),
            Ok(nothing),
            Ok(one_received()),
        ]);
        let record = harness.confirmed_test().await;

        let start = Instant::now();
        let report = harness.manager.check_test(&record.id).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(90), "{elapsed:?}");
        k9::assert_equal!(report.results, Some(one_received()));
        k9::assert_equal!(harness.detector.calls(), 3);
        harness.next_notification().await;
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_as_not_received() {
        let mut harness = Harness::new(vec![]);
        let record = harness.confirmed_test().await;

        let start = Instant::now();
        let report = harness.manager.check_test(&record.id).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(330), "{elapsed:?}");
        // Polls at 0s, 30s, ... 270s
        k9::assert_equal!(harness.detector.calls(), 10);

        let results = report.results.unwrap();
        k9::assert_equal!(results.len(), DEFAULT_TEST_INBOXES.len());
        for (r, inbox) in results.iter().zip(DEFAULT_TEST_INBOXES) {
            k9::assert_equal!(r.inbox, *inbox);
            k9::assert_equal!(r.status, PlacementStatus::NotReceived);
            k9::assert_equal!(r.folder, None);
        }
        harness.assert_no_notification().await;

        // The synthesized results are final too
        let again = harness.manager.check_test(&record.id).await.unwrap();
        k9::assert_equal!(again.results, Some(results));
        k9::assert_equal!(harness.detector.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_not_a_multiple_of_interval() {
        let harness = Harness::with_config(
            vec![],
            ManagerConfig {
                poll_interval: Duration::from_secs(30),
                poll_budget: Duration::from_secs(65),
                ..Default::default()
            },
            false,
        );
        let record = harness.confirmed_test().await;

        let start = Instant::now();
        let report = harness.manager.check_test(&record.id).await.unwrap();
        let elapsed = start.elapsed();
        // Polls at 0s, 30s and 60s, then waits out the remaining 5s
        assert!(elapsed >= Duration::from_secs(65), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(66), "{elapsed:?}");
        k9::assert_equal!(harness.detector.calls(), 3);
        assert!(report
            .results
            .unwrap()
            .iter()
            .all(|r| r.status == PlacementStatus::NotReceived));
    }

    /// Never answers
    struct StuckDetector;

    #[async_trait]
    impl PlacementDetector for StuckDetector {
        async fn detect(
            &self,
            _test_code: &str,
            _inboxes: &[String],
        ) -> anyhow::Result<Vec<InboxOutcome>> {
            std::future::pending().await
        }
    }

    /// Panics on the first call, then sees the message
    #[derive(Default)]
    struct PanicOnceDetector {
        panicked: AtomicBool,
    }

    #[async_trait]
    impl PlacementDetector for PanicOnceDetector {
        async fn detect(
            &self,
            _test_code: &str,
            _inboxes: &[String],
        ) -> anyhow::Result<Vec<InboxOutcome>> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("detector bug");
            }
            Ok(one_received())
        }
    }

    fn manager_with_detector(detector: Arc<dyn PlacementDetector>) -> TestManager {
        TestManager::new(
            ManagerConfig::default(),
            Arc::new(MemoryStore::new()),
            detector,
            Arc::new(LogNotifier),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_detector_is_bounded_by_budget() {
        let manager = manager_with_detector(Arc::new(StuckDetector));
        let record = manager.start_test("a@b.com").await.unwrap();
        manager.confirm_sent(&record.id).await.unwrap();

        let start = Instant::now();
        let report = manager.check_test(&record.id).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(301), "{elapsed:?}");
        k9::assert_equal!(report.results, Some(record.timed_out_results()));
    }

    #[tokio::test]
    async fn panicking_detector_releases_the_job() {
        let manager = manager_with_detector(Arc::new(PanicOnceDetector::default()));
        let record = manager.start_test("a@b.com").await.unwrap();
        manager.confirm_sent(&record.id).await.unwrap();

        assert!(matches!(
            manager.check_test(&record.id).await,
            Err(TestError::Internal(_))
        ));
        let status = manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Failed);
        k9::assert_equal!(status.error.as_deref(), Some("placement check was aborted"));

        let report = manager.check_test(&record.id).await.unwrap();
        k9::assert_equal!(report.results, Some(one_received()));
        let status = manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_notifies_when_policy_says_so() {
        let mut harness = Harness::with_config(
            vec![],
            ManagerConfig {
                notify_policy: NotifyPolicy::Always,
                ..Default::default()
            },
            false,
        );
        let record = harness.confirmed_test().await;
        let report = harness.manager.check_test(&record.id).await.unwrap();
        let (_, _, results) = harness.next_notification().await;
        k9::assert_equal!(Some(results), report.results);
        harness.assert_no_notification().await;
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_checks_share_one_job() {
        let nothing: Vec<InboxOutcome> = DEFAULT_TEST_INBOXES
            .iter()
            .map(|inbox| InboxOutcome::not_received(*inbox))
            .collect();
        let mut harness = Harness::new(vec![Ok(nothing), Ok(one_received())]);
        let record = harness.confirmed_test().await;

        let (a, b, c) = tokio::join!(
            harness.manager.check_test(&record.id),
            harness.manager.check_test(&record.id),
            harness.manager.check_test(&record.id),
        );
        let a = a.unwrap();
        k9::assert_equal!(a, b.unwrap());
        k9::assert_equal!(a, c.unwrap());
        k9::assert_equal!(harness.detector.calls(), 2);

        harness.next_notification().await;
        harness.assert_no_notification().await;
    }

    #[tokio::test]
    async fn detector_error_is_internal_and_retryable() {
        let mut harness = Harness::new(vec![
            Err(anyhow::anyhow!("imap login failed")),
            Ok(one_received()),
        ]);
        let record = harness.confirmed_test().await;

        match harness.manager.check_test(&record.id).await {
            Err(TestError::Internal(err)) => {
                assert!(format!("{err:#}").contains("imap login failed"), "{err:#}")
            }
            other => panic!("expected internal error, got {other:?}"),
        }

        let report = harness.manager.get_report(&record.id).await.unwrap();
        k9::assert_equal!(report.results, None);
        let status = harness.manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Failed);
        assert!(status.error.unwrap().contains("imap login failed"));
        harness.assert_no_notification().await;

        let report = harness.manager.check_test(&record.id).await.unwrap();
        k9::assert_equal!(report.results, Some(one_received()));
        let status = harness.manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Finished);
        k9::assert_equal!(status.error, None);
        harness.next_notification().await;
    }

    #[tokio::test]
    async fn incomplete_detector_results_are_rejected() {
        let harness = Harness::new(vec![Ok(vec![InboxOutcome::received(
            "testinbox.gmass@gmail.com",
            Folder::Inbox,
        )])]);
        let record = harness.confirmed_test().await;
        assert!(matches!(
            harness.manager.check_test(&record.id).await,
            Err(TestError::Internal(_))
        ));
        k9::assert_equal!(
            harness.manager.get_report(&record.id).await.unwrap().results,
            None
        );
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_check() {
        let mut harness =
            Harness::with_config(vec![Ok(one_received())], ManagerConfig::default(), true);
        let record = harness.confirmed_test().await;
        let report = harness.manager.check_test(&record.id).await.unwrap();
        k9::assert_equal!(report.results, Some(one_received()));
        harness.next_notification().await;
    }

    #[tokio::test]
    async fn report_requires_confirmation() {
        let harness = Harness::new(vec![]);
        let record = harness.manager.start_test("a@b.com").await.unwrap();
        match harness.manager.get_report(&record.id).await {
            Err(TestError::NotFound(msg)) => {
                k9::assert_equal!(msg, "Report not ready");
            }
            other => panic!("expected not found, got {other:?}"),
        }
        assert!(matches!(
            harness.manager.get_report(&TestId::generate()).await,
            Err(TestError::NotFound(_))
        ));

        harness.manager.confirm_sent(&record.id).await.unwrap();
        let report = harness.manager.get_report(&record.id).await.unwrap();
        k9::assert_equal!(report.results, None);
        k9::assert_equal!(report.test_inboxes, record.test_inboxes);
    }

    #[tokio::test(start_paused = true)]
    async fn background_check_progress() {
        let harness = Harness::new(vec![]);
        let record = harness.confirmed_test().await;

        let status = harness.manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Idle);

        let status = harness.manager.begin_check(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Polling);
        assert!(status.started_at.is_some());

        tokio::time::sleep(Duration::from_secs(45)).await;
        let status = harness.manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Polling);
        k9::assert_equal!(status.attempts, 2);

        // Joining does not restart the job
        let status = harness.manager.begin_check(&record.id).await.unwrap();
        k9::assert_equal!(status.attempts, 2);

        tokio::time::sleep(Duration::from_secs(300)).await;
        let status = harness.manager.check_status(&record.id).await.unwrap();
        k9::assert_equal!(status.state, CheckState::Finished);
        k9::assert_equal!(status.results.map(|r| r.len()), Some(5));
        k9::assert_equal!(harness.detector.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_polling() {
        let mut harness = Harness::new(vec![]);
        let record = harness.confirmed_test().await;

        harness.manager.begin_check(&record.id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        harness.manager.shutdown();

        match harness.manager.check_test(&record.id).await {
            Err(TestError::Internal(err)) => {
                assert!(format!("{err:#}").contains("shutting down"), "{err:#}")
            }
            other => panic!("expected internal error, got {other:?}"),
        }
        k9::assert_equal!(harness.detector.calls(), 1);
        k9::assert_equal!(
            harness.manager.get_report(&record.id).await.unwrap().results,
            None
        );
        harness.assert_no_notification().await;
    }

    struct CrowdedStore(MemoryStore);

    #[async_trait]
    impl ResultStore for CrowdedStore {
        async fn insert(&self, record: TestRecord) -> anyhow::Result<()> {
            self.0.insert(record).await
        }
        async fn get(&self, id: &TestId) -> anyhow::Result<Option<TestRecord>> {
            self.0.get(id).await
        }
        async fn code_in_use(&self, _code: &str) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn mark_sent(&self, id: &TestId) -> anyhow::Result<bool> {
            self.0.mark_sent(id).await
        }
        async fn finalize(
            &self,
            id: &TestId,
            results: Vec<InboxOutcome>,
        ) -> anyhow::Result<Finalized> {
            self.0.finalize(id, results).await
        }
    }

    #[tokio::test]
    async fn exhausted_codes() {
        let (tx, _rx) = unbounded_channel();
        let manager = TestManager::new(
            ManagerConfig::default(),
            Arc::new(CrowdedStore(MemoryStore::new())),
            Arc::new(ScriptedDetector::default()),
            Arc::new(ChannelNotifier { tx, fail: false }),
        )
        .unwrap();
        assert!(matches!(
            manager.start_test("a@b.com").await,
            Err(TestError::Internal(_))
        ));
    }

    #[test]
    fn config_validation() {
        assert!(ManagerConfig::default().validate().is_ok());
        assert!(ManagerConfig {
            test_inboxes: vec![],
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ManagerConfig {
            test_inboxes: vec!["not an address".to_string()],
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ManagerConfig {
            test_inboxes: vec!["a@b.com".to_string(), "a@b.com".to_string()],
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(ManagerConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
