//! Subscription tiers and their admission limits

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Subscription class reported by the auth service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Moderate,
    High,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 3] = [
        SubscriptionTier::Free,
        SubscriptionTier::Moderate,
        SubscriptionTier::High,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Moderate => "moderate",
            SubscriptionTier::High => "high",
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown subscription tier: {0:?}")]
pub struct UnknownTier(pub String);

impl FromStr for SubscriptionTier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        SubscriptionTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownTier(name.to_string()))
    }
}

/// Concurrency cap and token-bucket refill rate for one tier
///
/// The cap doubles as the bucket's burst capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierLimits {
    pub max_concurrent: usize,
    pub rate_per_second: f64,
}

impl TierLimits {
    pub fn new(max_concurrent: usize, rate_per_second: f64) -> Self {
        Self {
            max_concurrent,
            rate_per_second,
        }
    }

    /// Cap of `n` connections refilled at `n` per second
    pub fn uniform(n: usize) -> Self {
        Self::new(n, n as f64)
    }
}

/// Limits for every tier, fixed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    free: TierLimits,
    moderate: TierLimits,
    high: TierLimits,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: TierLimits::uniform(2),
            moderate: TierLimits::uniform(50),
            high: TierLimits::uniform(100),
        }
    }
}

impl TierTable {
    pub fn new(free: TierLimits, moderate: TierLimits, high: TierLimits) -> Self {
        Self {
            free,
            moderate,
            high,
        }
    }

    pub fn limits(&self, tier: SubscriptionTier) -> TierLimits {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Moderate => self.moderate,
            SubscriptionTier::High => self.high,
        }
    }

    /// Tier with the lowest cap, then the lowest rate
    pub fn most_restrictive(&self) -> SubscriptionTier {
        SubscriptionTier::ALL
            .into_iter()
            .min_by(|a, b| {
                let (a, b) = (self.limits(*a), self.limits(*b));
                a.max_concurrent
                    .cmp(&b.max_concurrent)
                    .then(a.rate_per_second.total_cmp(&b.rate_per_second))
            })
            .unwrap_or(SubscriptionTier::Free)
    }

    /// Map a tier name from the auth service onto a known tier.
    ///
    /// Missing or unknown names fall back to the most restrictive tier.
    pub fn resolve(&self, name: Option<&str>) -> SubscriptionTier {
        match name.map(str::parse::<SubscriptionTier>) {
            Some(Ok(tier)) => tier,
            Some(Err(e)) => {
                warn!("{}, using most restrictive tier", e);
                self.most_restrictive()
            }
            None => self.most_restrictive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let table = TierTable::default();
        assert_eq!(table.limits(SubscriptionTier::Free), TierLimits::new(2, 2.0));
        assert_eq!(table.limits(SubscriptionTier::Moderate).max_concurrent, 50);
        assert_eq!(table.limits(SubscriptionTier::High).rate_per_second, 100.0);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("Moderate".parse::<SubscriptionTier>().unwrap(), SubscriptionTier::Moderate);
        assert_eq!(" HIGH ".parse::<SubscriptionTier>().unwrap(), SubscriptionTier::High);
        assert!("platinum".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_unknown_tier_resolves_to_most_restrictive() {
        let table = TierTable::default();
        assert_eq!(table.resolve(Some("platinum")), SubscriptionTier::Free);
        assert_eq!(table.resolve(None), SubscriptionTier::Free);
        assert_eq!(table.resolve(Some("high")), SubscriptionTier::High);
    }

    #[test]
    fn test_most_restrictive_follows_configuration() {
        let table = TierTable::new(
            TierLimits::uniform(10),
            TierLimits::uniform(5),
            TierLimits::new(5, 1.0),
        );
        assert_eq!(table.most_restrictive(), SubscriptionTier::High);
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&SubscriptionTier::Moderate).unwrap(), "\"moderate\"");
        let tier: SubscriptionTier = serde_json::from_str("\"free\"").unwrap();
        assert_eq!(tier, SubscriptionTier::Free);
    }
}
