use anyhow::Context;
use axum::http::HeaderValue;
use placement_check::{
    HttpInjectNotifier, LogNotifier, ManagerConfig, MemoryStore, Notifier, NotifyPolicy,
    RandomDetector, ResultStore, SqliteStore, Url, DEFAULT_TEST_INBOXES,
};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "DaemonConfig::default_listen")]
    pub listen: String,

    /// Origins that browsers may call the api from
    #[serde(default = "DaemonConfig::default_cors_origins")]
    pub cors_origins: Vec<String>,

    #[serde(default = "DaemonConfig::default_test_inboxes")]
    pub test_inboxes: Vec<String>,

    #[serde(
        default = "DaemonConfig::default_poll_interval",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_interval: Duration,

    #[serde(
        default = "DaemonConfig::default_poll_budget",
        deserialize_with = "duration::deserialize"
    )]
    pub poll_budget: Duration,

    #[serde(default)]
    pub notify_policy: NotifyPolicy,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub detector: RandomDetector,

    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum StoreConfig {
    /// Tests are lost when the process exits
    #[default]
    Memory,
    Sqlite { path: String },
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum NotifierConfig {
    #[default]
    Log,
    /// Hand the report to a message injection endpoint
    HttpInject {
        url: String,
        sender: String,
        #[serde(
            default = "NotifierConfig::default_timeout",
            deserialize_with = "duration::deserialize"
        )]
        timeout: Duration,
    },
}

impl NotifierConfig {
    fn default_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn build(&self) -> anyhow::Result<Arc<dyn Notifier>> {
        Ok(match self {
            Self::Log => Arc::new(LogNotifier),
            Self::HttpInject {
                url,
                sender,
                timeout,
            } => {
                let url: Url = url
                    .parse()
                    .with_context(|| format!("notifier url {url:?} is invalid"))?;
                Arc::new(HttpInjectNotifier::new(url, sender.clone(), *timeout)?)
            }
        })
    }
}

impl StoreConfig {
    pub fn build(&self) -> anyhow::Result<Arc<dyn ResultStore>> {
        Ok(match self {
            Self::Memory => Arc::new(MemoryStore::new()),
            Self::Sqlite { path } => Arc::new(
                SqliteStore::open(path).with_context(|| format!("opening test store {path}"))?,
            ),
        })
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            cors_origins: Self::default_cors_origins(),
            test_inboxes: Self::default_test_inboxes(),
            poll_interval: Self::default_poll_interval(),
            poll_budget: Self::default_poll_budget(),
            notify_policy: NotifyPolicy::default(),
            store: StoreConfig::default(),
            detector: RandomDetector::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl DaemonConfig {
    fn default_listen() -> String {
        "127.0.0.1:8000".to_string()
    }

    fn default_cors_origins() -> Vec<String> {
        vec!["http://localhost:5173".to_string()]
    }

    fn default_test_inboxes() -> Vec<String> {
        DEFAULT_TEST_INBOXES.iter().map(|s| s.to_string()).collect()
    }

    fn default_poll_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_poll_budget() -> Duration {
        Duration::from_secs(300)
    }

    /// Load the config from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("{} not found, using default configuration", path.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.manager_config().validate()?;
        self.detector.validate()?;
        self.cors_origins()?;
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            test_inboxes: self.test_inboxes.clone(),
            poll_interval: self.poll_interval,
            poll_budget: self.poll_budget,
            notify_policy: self.notify_policy,
        }
    }

    pub fn cors_origins(&self) -> anyhow::Result<Vec<HeaderValue>> {
        self.cors_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("cors origin {origin:?} is invalid"))
            })
            .collect()
    }
}

/// Durations are either humantime strings such as "30s" or "5m",
/// or an integer number of seconds
mod duration {
    use serde::de::{Deserializer, Error, Unexpected, Visitor};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct V;

        impl Visitor<'_> for V {
            type Value = Duration;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("a duration such as \"30s\" or a number of seconds")
            }

            fn visit_u64<E: Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::invalid_value(Unexpected::Signed(v), &self))
            }

            fn visit_str<E: Error>(self, v: &str) -> Result<Duration, E> {
                humantime::parse_duration(v)
                    .map_err(|_| E::invalid_value(Unexpected::Str(v), &self))
            }
        }

        d.deserialize_any(V)
    }
}
