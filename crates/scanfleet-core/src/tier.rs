//! Capacity tiers and the scan size classifier.
//!
//! A tier buckets scans by estimated lines of code and maps the bucket to
//! a cloud instance type. The `TierSet` is read-only after configuration
//! load, so classification is thread-safe by construction.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TierError};

/// One configured capacity tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineTier {
    pub name: String,
    /// Inclusive lower LOC bound.
    pub min_loc: u64,
    /// Exclusive upper LOC bound.
    pub max_loc: u64,
    /// Standing idle engines to keep provisioned ahead of demand.
    pub min_idle: u32,
    /// Hard cap on engines of this tier, live or not.
    pub max_count: u32,
    /// Cloud instance type backing this tier (e.g. "m5.large").
    pub instance_type: String,
}

/// The configured tier table, ordered by ascending upper bound.
#[derive(Debug, Clone)]
pub struct TierSet {
    tiers: Vec<EngineTier>,
}

impl TierSet {
    /// Build a validated tier set. Rejects an empty table, inverted or
    /// overlapping bounds, duplicate names, and min_idle above max_count.
    pub fn new(mut tiers: Vec<EngineTier>) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::NoTiers);
        }
        let mut names = std::collections::HashSet::new();
        for tier in &tiers {
            if tier.max_loc <= tier.min_loc {
                return Err(ConfigError::TierBounds(tier.name.clone()));
            }
            if tier.min_idle > tier.max_count {
                return Err(ConfigError::IdleAboveMax(tier.name.clone()));
            }
            if !names.insert(tier.name.clone()) {
                return Err(ConfigError::DuplicateTier(tier.name.clone()));
            }
        }
        tiers.sort_by_key(|t| t.max_loc);
        for pair in tiers.windows(2) {
            if pair[1].min_loc < pair[0].max_loc {
                return Err(ConfigError::TierOverlap(
                    pair[0].name.clone(),
                    pair[1].name.clone(),
                ));
            }
        }
        Ok(Self { tiers })
    }

    /// Classify a LOC estimate into the smallest-maximum tier whose
    /// `[min, max)` bounds contain it.
    pub fn classify(&self, loc: i64) -> Result<&EngineTier, TierError> {
        if loc >= 0 {
            let loc = loc as u64;
            for tier in &self.tiers {
                if loc >= tier.min_loc && loc < tier.max_loc {
                    return Ok(tier);
                }
            }
        }
        Err(TierError::NoMatchingTier(loc))
    }

    /// The cloud instance type configured for a tier.
    pub fn instance_type(&self, tier: &str) -> Result<&str, TierError> {
        self.get(tier)
            .map(|t| t.instance_type.as_str())
            .ok_or_else(|| TierError::UnknownTier(tier.to_string()))
    }

    pub fn get(&self, tier: &str) -> Option<&EngineTier> {
        self.tiers.iter().find(|t| t.name == tier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineTier> {
        self.tiers.iter()
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(name: &str, min_loc: u64, max_loc: u64) -> EngineTier {
        EngineTier {
            name: name.to_string(),
            min_loc,
            max_loc,
            min_idle: 0,
            max_count: 4,
            instance_type: "m5.large".to_string(),
        }
    }

    fn standard_tiers() -> TierSet {
        TierSet::new(vec![
            tier("large", 50_000, 100_000),
            tier("small", 0, 10_000),
            tier("medium", 10_000, 50_000),
        ])
        .unwrap()
    }

    #[test]
    fn classify_picks_the_covering_tier() {
        let tiers = standard_tiers();
        assert_eq!(tiers.classify(15_000).unwrap().name, "medium");
        assert_eq!(tiers.classify(0).unwrap().name, "small");
        assert_eq!(tiers.classify(99_999).unwrap().name, "large");
    }

    #[test]
    fn classify_lower_bound_is_inclusive_upper_exclusive() {
        let tiers = standard_tiers();
        assert_eq!(tiers.classify(9_999).unwrap().name, "small");
        assert_eq!(tiers.classify(10_000).unwrap().name, "medium");
    }

    #[test]
    fn classify_rejects_negative_loc() {
        let tiers = standard_tiers();
        assert_eq!(tiers.classify(-1), Err(TierError::NoMatchingTier(-1)));
    }

    #[test]
    fn classify_rejects_loc_above_largest_tier() {
        let tiers = standard_tiers();
        assert_eq!(
            tiers.classify(100_000),
            Err(TierError::NoMatchingTier(100_000))
        );
    }

    #[test]
    fn classify_rejects_gap_between_tiers() {
        let tiers = TierSet::new(vec![tier("small", 0, 10_000), tier("large", 50_000, 100_000)])
            .unwrap();
        assert_eq!(
            tiers.classify(20_000),
            Err(TierError::NoMatchingTier(20_000))
        );
    }

    #[test]
    fn instance_type_lookup() {
        let tiers = standard_tiers();
        assert_eq!(tiers.instance_type("medium").unwrap(), "m5.large");
        assert_eq!(
            tiers.instance_type("gigantic"),
            Err(TierError::UnknownTier("gigantic".to_string()))
        );
    }

    #[test]
    fn empty_table_is_rejected() {
        assert_eq!(TierSet::new(vec![]).unwrap_err(), ConfigError::NoTiers);
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let result = TierSet::new(vec![tier("small", 10_000, 10_000)]);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::TierBounds("small".to_string())
        );
    }

    #[test]
    fn overlapping_tiers_are_rejected() {
        let result = TierSet::new(vec![tier("small", 0, 12_000), tier("medium", 10_000, 50_000)]);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::TierOverlap("small".to_string(), "medium".to_string())
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = TierSet::new(vec![tier("small", 0, 10_000), tier("small", 10_000, 20_000)]);
        assert_eq!(
            result.unwrap_err(),
            ConfigError::DuplicateTier("small".to_string())
        );
    }

    #[test]
    fn min_idle_above_max_count_is_rejected() {
        let mut t = tier("small", 0, 10_000);
        t.min_idle = 5;
        t.max_count = 2;
        assert_eq!(
            TierSet::new(vec![t]).unwrap_err(),
            ConfigError::IdleAboveMax("small".to_string())
        );
    }
}
