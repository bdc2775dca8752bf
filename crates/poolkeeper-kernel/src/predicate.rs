//! Attribute predicate used by `acquire`.
//!
//! A predicate is a conjunction: every constraint that is set must hold. An
//! empty predicate matches any record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::ResourceRecord;

/// Inclusive age window in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: u32,
    pub max: u32,
}

impl AgeRange {
    pub fn contains(&self, days: u32) -> bool {
        (self.min..=self.max).contains(&days)
    }
}

/// Conjunction of attribute constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchPredicate {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub age_days: Option<AgeRange>,
    #[serde(default)]
    pub min_reputation: Option<f64>,
    #[serde(default)]
    pub proxy_required: Option<bool>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl MatchPredicate {
    /// A predicate with no constraints.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn age_days(mut self, min: u32, max: u32) -> Self {
        self.age_days = Some(AgeRange { min, max });
        self
    }

    pub fn min_reputation(mut self, threshold: f64) -> Self {
        self.min_reputation = Some(threshold);
        self
    }

    pub fn proxy_required(mut self, required: bool) -> Self {
        self.proxy_required = Some(required);
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Test the predicate against a record's attributes. Lease and status
    /// are not considered here.
    pub fn matches(&self, record: &ResourceRecord) -> bool {
        let attrs = &record.attributes;

        if let Some(country) = &self.country {
            if attrs.country.as_deref() != Some(country.as_str()) {
                return false;
            }
        }

        if let Some(range) = &self.age_days {
            if !range.contains(attrs.age_days) {
                return false;
            }
        }

        if let Some(threshold) = self.min_reputation {
            if attrs.reputation < threshold {
                return false;
            }
        }

        if let Some(required) = self.proxy_required {
            if attrs.proxy_required != required {
                return false;
            }
        }

        self.extensions
            .iter()
            .all(|(key, expected)| attrs.extensions.get(key) == Some(expected))
    }
}
