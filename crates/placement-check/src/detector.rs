use async_trait::async_trait;
use placement_api_types::{Folder, InboxOutcome};
use rand::Rng;
use serde::Deserialize;

/// Inspects the test inboxes for copies of a message carrying a given
/// test code.
///
/// Implementations must return exactly one outcome per inbox and must
/// be cheap enough to call once per poll interval.
#[async_trait]
pub trait PlacementDetector: Send + Sync + 'static {
    async fn detect(&self, test_code: &str, inboxes: &[String])
        -> anyhow::Result<Vec<InboxOutcome>>;
}

/// A stand-in detector that makes up plausible looking results.
/// Useful for demos and for exercising the rest of the system
/// until a real mailbox integration is available.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RandomDetector {
    /// Probability that any given inbox reports the message as received
    #[serde(default = "RandomDetector::default_received")]
    pub received: f64,
    /// Of the received messages, the fraction placed in the inbox
    #[serde(default = "RandomDetector::default_inbox")]
    pub inbox: f64,
    /// Of the received messages, the fraction placed in promotions.
    /// Everything else lands in spam.
    #[serde(default = "RandomDetector::default_promotions")]
    pub promotions: f64,
}

impl Default for RandomDetector {
    fn default() -> Self {
        Self {
            received: Self::default_received(),
            inbox: Self::default_inbox(),
            promotions: Self::default_promotions(),
        }
    }
}

impl RandomDetector {
    fn default_received() -> f64 {
        0.8
    }

    fn default_inbox() -> f64 {
        0.6
    }

    fn default_promotions() -> f64 {
        0.2
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("received", self.received),
            ("inbox", self.inbox),
            ("promotions", self.promotions),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("detector.{name} must be between 0 and 1, got {value}");
            }
        }
        if self.inbox + self.promotions > 1.0 {
            anyhow::bail!("detector.inbox + detector.promotions must not exceed 1");
        }
        Ok(())
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, inboxes: &[String]) -> Vec<InboxOutcome> {
        inboxes
            .iter()
            .map(|inbox| {
                if rng.gen::<f64>() >= self.received {
                    return InboxOutcome::not_received(inbox);
                }
                let roll: f64 = rng.gen();
                let folder = if roll < self.inbox {
                    Folder::Inbox
                } else if roll < self.inbox + self.promotions {
                    Folder::Promotions
                } else {
                    Folder::Spam
                };
                InboxOutcome::received(inbox, folder)
            })
            .collect()
    }
}

#[async_trait]
impl PlacementDetector for RandomDetector {
    async fn detect(
        &self,
        test_code: &str,
        inboxes: &[String],
    ) -> anyhow::Result<Vec<InboxOutcome>> {
        let results = self.sample(&mut rand::thread_rng(), inboxes);
        tracing::debug!("simulated placement for {test_code}: {results:?}");
        Ok(results)
    }
}
