//! Resource record data model
//!
//! A resource record is a leasable, stateful entity managed by the pool. Two
//! independent axes describe it:
//!
//! - **lifecycle status** ([`ResourceStatus`]), owned by the lifecycle engine
//! - **lease state** ([`LeaseState`]), owned by the pool allocator
//!
//! ```text
//!   NEW ──► VERIFIED ──► ACTIVE ◄──────────┐
//!    │          │         │  │  │          │ re-admission
//!    ▼          ▼         │  │  ▼          │
//!  BANNED ◄── FLAGGED ◄───┘  │ SUSPENDED ──┘
//!               │            │     │
//!               └──► SUSPENDED     ▼
//!                            └──► RETIRED
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, totally ordered resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-ordered id (UUIDv7), so ascending id order
    /// follows creation order.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Token identifying the caller that holds a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(String);

impl HolderToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HolderToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Matchable attributes of a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAttributes {
    /// ISO country code
    #[serde(default)]
    pub country: Option<String>,
    /// Age of the underlying resource in days
    #[serde(default)]
    pub age_days: u32,
    /// Reputation score in [0, 1]
    #[serde(default)]
    pub reputation: f64,
    /// Whether the resource must be used behind a proxy
    #[serde(default)]
    pub proxy_required: bool,
    /// Arbitrary extension fields, matched by equality
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl ResourceAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_age_days(mut self, days: u32) -> Self {
        self.age_days = days;
        self
    }

    pub fn with_reputation(mut self, reputation: f64) -> Self {
        self.reputation = reputation;
        self
    }

    pub fn with_proxy_required(mut self, required: bool) -> Self {
        self.proxy_required = required;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }
}

/// Lifecycle status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    New,
    Verified,
    Active,
    Flagged,
    Suspended,
    Retired,
    Banned,
}

impl ResourceStatus {
    /// Statuses reachable from `self` in one step.
    pub fn allowed_targets(self) -> &'static [ResourceStatus] {
        use ResourceStatus::*;
        match self {
            New => &[Verified, Banned],
            Verified => &[Active, Flagged],
            Active => &[Suspended, Retired, Flagged],
            Flagged => &[Suspended, Banned],
            Suspended => &[Retired, Active],
            Retired | Banned => &[],
        }
    }

    pub fn can_transition_to(self, target: ResourceStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// Terminal statuses have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceStatus::Retired | ResourceStatus::Banned)
    }

    /// Whether a free record in this status may be handed out by `acquire`.
    pub fn is_matchable(self) -> bool {
        matches!(
            self,
            ResourceStatus::New | ResourceStatus::Verified | ResourceStatus::Active
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceStatus::New => "NEW",
            ResourceStatus::Verified => "VERIFIED",
            ResourceStatus::Active => "ACTIVE",
            ResourceStatus::Flagged => "FLAGGED",
            ResourceStatus::Suspended => "SUSPENDED",
            ResourceStatus::Retired => "RETIRED",
            ResourceStatus::Banned => "BANNED",
        };
        f.write_str(name)
    }
}

/// Exclusive binding of a resource to a holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: HolderToken,
    pub acquired_at_ms: u64,
    /// Lease time-to-live; `None` never expires
    pub ttl_ms: Option<u64>,
}

impl Lease {
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.ttl_ms
            .map(|ttl| self.acquired_at_ms.saturating_add(ttl))
    }

    /// A lease is expired once `now` reaches `acquired_at + ttl`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms().is_some_and(|deadline| now_ms >= deadline)
    }
}

/// Lease state of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LeaseState {
    #[default]
    Free,
    Leased(Lease),
}

impl LeaseState {
    pub fn is_free(&self) -> bool {
        matches!(self, LeaseState::Free)
    }

    pub fn lease(&self) -> Option<&Lease> {
        match self {
            LeaseState::Free => None,
            LeaseState::Leased(lease) => Some(lease),
        }
    }

    pub fn is_held_by(&self, holder: &HolderToken) -> bool {
        self.lease().is_some_and(|lease| &lease.holder == holder)
    }
}

/// Per-record counters and failure markers persisted with the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounters {
    /// Times an expired lease on this record was reclaimed
    pub reclaimed_count: u64,
    /// Times the risk gate flagged this record
    pub flag_count: u64,
    /// Set when a warmup plan failed
    pub warmup_failed: bool,
    /// Reason of the most recent plan failure
    pub last_failure_reason: Option<String>,
}

/// A resource record as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub attributes: ResourceAttributes,
    pub status: ResourceStatus,
    /// Incremented on every status change; a plan started at version `v`
    /// is stale once the record moves past `v`.
    pub status_version: u64,
    pub lease: LeaseState,
    pub created_at_ms: u64,
    pub last_transition_at_ms: u64,
    pub last_scored_at_ms: Option<u64>,
    pub counters: RecordCounters,
}

impl ResourceRecord {
    /// A freshly provisioned record: NEW and free.
    pub fn new(id: ResourceId, attributes: ResourceAttributes, now_ms: u64) -> Self {
        Self {
            id,
            attributes,
            status: ResourceStatus::New,
            status_version: 0,
            lease: LeaseState::Free,
            created_at_ms: now_ms,
            last_transition_at_ms: now_ms,
            last_scored_at_ms: None,
            counters: RecordCounters::default(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.lease.is_free()
    }

    /// Free and in a matchable status.
    pub fn is_available(&self) -> bool {
        self.is_free() && self.status.is_matchable()
    }

    /// Apply a status change and bump the version. Validation is the
    /// caller's job.
    pub fn set_status(&mut self, status: ResourceStatus, now_ms: u64) {
        self.status = status;
        self.status_version += 1;
        self.last_transition_at_ms = now_ms;
    }
}
