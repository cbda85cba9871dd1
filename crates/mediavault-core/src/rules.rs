//! Placement rules and location classification.
//!
//! Within a rule every configured predicate must hold; a location is eligible
//! when any of its rules holds. Predicates over attributes the asset does not
//! carry (no quality score, say) do not match.

use crate::storage::models::{Asset, Location, MediaType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_age_days: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_types: Vec<MediaType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_types: Vec<MediaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,
}

impl Rule {
    /// A rule without predicates matches everything.
    pub fn is_catch_all(&self) -> bool {
        *self == Rule::default()
    }

    pub fn matches(&self, asset: &Asset, now: DateTime<Utc>) -> bool {
        let age = asset.age_days(now);
        if self.max_age_days.is_some_and(|max| age > max) {
            return false;
        }
        if self.min_age_days.is_some_and(|min| age < min) {
            return false;
        }

        if self.min_quality.is_some() || self.max_quality.is_some() {
            let Some(quality) = asset.quality_score else {
                return false;
            };
            if self.min_quality.is_some_and(|min| quality < min) {
                return false;
            }
            if self.max_quality.is_some_and(|max| quality > max) {
                return false;
            }
        }

        if !self.include_types.is_empty() && !self.include_types.contains(&asset.media_type) {
            return false;
        }
        if self.exclude_types.contains(&asset.media_type) {
            return false;
        }

        if self.min_size_bytes.is_some_and(|min| asset.size < min) {
            return false;
        }
        if self.max_size_bytes.is_some_and(|max| asset.size > max) {
            return false;
        }

        if !self.require_tags.iter().all(|t| asset.tags.contains(t)) {
            return false;
        }
        if self.exclude_tags.iter().any(|t| asset.tags.contains(t)) {
            return false;
        }

        true
    }

    /// Reject bounds that can never be satisfied together.
    pub fn validate(&self) -> Result<(), String> {
        if let (Some(min), Some(max)) = (self.min_age_days, self.max_age_days) {
            if min > max {
                return Err(format!("min_age_days {} > max_age_days {}", min, max));
            }
        }
        if let (Some(min), Some(max)) = (self.min_quality, self.max_quality) {
            if min > max {
                return Err(format!("min_quality {} > max_quality {}", min, max));
            }
        }
        if let (Some(min), Some(max)) = (self.min_size_bytes, self.max_size_bytes) {
            if min > max {
                return Err(format!("min_size_bytes {} > max_size_bytes {}", min, max));
            }
        }
        Ok(())
    }
}

/// Stateless classifier pinned to a reference time, so repeated calls agree.
#[derive(Debug, Clone, Copy)]
pub struct RuleEngine {
    now: DateTime<Utc>,
}

impl RuleEngine {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn location_matches(&self, asset: &Asset, location: &Location) -> bool {
        location.rules.iter().any(|rule| rule.matches(asset, self.now))
    }

    /// Eligible location names, best first: priority descending, then
    /// registration order. Falls back to the default location when nothing
    /// matches; empty when there is no default either.
    pub fn classify(&self, asset: &Asset, locations: &[Location]) -> Vec<String> {
        let mut eligible: Vec<&Location> = locations
            .iter()
            .filter(|loc| self.location_matches(asset, loc))
            .collect();
        eligible.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        if eligible.is_empty() {
            return locations
                .iter()
                .filter(|loc| loc.is_default)
                .min_by_key(|loc| loc.id)
                .map(|loc| vec![loc.name.clone()])
                .unwrap_or_default();
        }

        eligible.into_iter().map(|loc| loc.name.clone()).collect()
    }
}
