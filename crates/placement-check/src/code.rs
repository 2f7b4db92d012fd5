use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ADJECTIVES: &[&str] = &["swift", "silent", "brave", "calm", "eager"];
pub const NOUNS: &[&str] = &["river", "ocean", "breeze", "spark", "flame"];

/// Produce a human friendly code such as `brave-ocean-4821`.
/// There are only 225,000 possible codes, so callers must be
/// prepared to deal with collisions.
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("swift");
    let noun = NOUNS.choose(rng).copied().unwrap_or("river");
    let num: u16 = rng.gen_range(1000..=9999);
    format!("{adjective}-{noun}-{num}")
}

/// Opaque identifier for a test record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(Uuid);

impl TestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TestId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(fmt)
    }
}

impl std::str::FromStr for TestId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
