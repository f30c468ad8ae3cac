//! Accuracy tiers and their position-source options.

use serde::{Deserialize, Serialize};

/// Options handed to the position source for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixOptions {
    pub enable_high_accuracy: bool,
    pub maximum_age_ms: u64,
    pub timeout_ms: u64,
}

/// Location accuracy tier. Sessions start in `High` and step down one tier
/// per timeout, trading precision for reliability. A session never upgrades
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    High,
    Balanced,
    Low,
}

impl AccuracyTier {
    pub fn options(&self) -> FixOptions {
        match self {
            AccuracyTier::High => FixOptions {
                enable_high_accuracy: true,
                maximum_age_ms: 5_000,
                timeout_ms: 10_000,
            },
            AccuracyTier::Balanced => FixOptions {
                enable_high_accuracy: true,
                maximum_age_ms: 15_000,
                timeout_ms: 15_000,
            },
            AccuracyTier::Low => FixOptions {
                enable_high_accuracy: false,
                maximum_age_ms: 30_000,
                timeout_ms: 20_000,
            },
        }
    }

    /// The next tier down, or `None` when already at the bottom.
    pub fn degraded(&self) -> Option<AccuracyTier> {
        match self {
            AccuracyTier::High => Some(AccuracyTier::Balanced),
            AccuracyTier::Balanced => Some(AccuracyTier::Low),
            AccuracyTier::Low => None,
        }
    }
}
