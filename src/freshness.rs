//! Cache-validity windows
//!
//! Every response carries a [`FreshnessWindow`]. Data that can no longer
//! change (archived measurements, time ranges older than the settlement
//! delay) is sealed and may be cached for a long time; anything else gets a
//! short TTL. The engine holds no cache of its own.

use crate::clock::Clock;
use crate::measurement::StorageTier;
use crate::query::TimeRange;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Freshness settings
#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    /// How long after the fact measurements may still arrive or change
    pub settlement_delay: chrono::Duration,
    /// Validity of responses over unsealed data
    pub short_ttl: chrono::Duration,
    /// Validity of responses over sealed data
    pub sealed_ttl: chrono::Duration,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            settlement_delay: chrono::Duration::hours(72),
            short_ttl: chrono::Duration::seconds(60),
            sealed_ttl: chrono::Duration::days(365),
        }
    }
}

/// Validity window attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessWindow {
    pub valid_until: DateTime<Utc>,
    pub is_sealed: bool,
}

impl FreshnessWindow {
    /// Seconds left until `valid_until`, never negative.
    pub fn max_age(&self, now: DateTime<Utc>) -> u64 {
        (self.valid_until - now).num_seconds().max(0) as u64
    }

    /// `Cache-Control` value for the fronting layer.
    pub fn cache_control(&self, now: DateTime<Utc>) -> String {
        if self.is_sealed {
            format!("max-age={}, immutable", self.max_age(now))
        } else {
            format!("max-age={}", self.max_age(now))
        }
    }
}

#[derive(Debug, Clone)]
pub struct FreshnessCalculator {
    policy: FreshnessPolicy,
    clock: Arc<dyn Clock>,
}

impl FreshnessCalculator {
    pub fn new(policy: FreshnessPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Window for data covering `time_range` read from `tier`.
    ///
    /// A missing range means the data's time is unknown and is treated as
    /// unsealed, except on the archive tier which is always sealed.
    pub fn compute(&self, time_range: Option<&TimeRange>, tier: StorageTier) -> FreshnessWindow {
        let now = self.clock.now();
        let settled_before = now - self.policy.settlement_delay;
        let is_sealed = tier == StorageTier::Archive
            || time_range.is_some_and(|range| range.end < settled_before);

        let ttl = if is_sealed {
            self.policy.sealed_ttl
        } else {
            self.policy.short_ttl
        };
        FreshnessWindow {
            valid_until: now + ttl,
            is_sealed,
        }
    }

    /// Window for a single measurement that started at `start`.
    pub fn for_measurement(
        &self,
        start: Option<DateTime<Utc>>,
        tier: StorageTier,
    ) -> FreshnessWindow {
        let point = start.map(|t| TimeRange::new(t, t + chrono::Duration::seconds(1)));
        self.compute(point.as_ref(), tier)
    }
}
