//! Inbox placement testing.
//!
//! A user starts a test and receives a test code plus a list of test
//! inboxes. They send a message containing the code to those inboxes,
//! confirm that they did so, and then ask for a check. The check polls a
//! [`PlacementDetector`] until the message shows up in at least one inbox
//! or the poll budget is exhausted, records the outcome exactly once and
//! hands the report to a [`Notifier`].
pub mod code;
pub mod detector;
pub mod error;
pub mod lifecycle;
pub mod notifier;
pub mod record;
pub mod store;

pub use code::TestId;
pub use detector::{PlacementDetector, RandomDetector};
pub use error::TestError;
pub use lifecycle::{ManagerConfig, NotifyPolicy, TestManager, DEFAULT_TEST_INBOXES};
pub use notifier::{HttpInjectNotifier, LogNotifier, Notifier};
pub use record::TestRecord;
pub use reqwest::Url;
pub use store::{Finalized, MemoryStore, ResultStore, SqliteStore};
