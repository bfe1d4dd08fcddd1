//! Per-access-point scan rate limiting.
//!
//! Checked by the scan handler before validation, so a throttled request
//! never reaches storage and leaves no scan attempt behind.

use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter as GovRateLimiter,
};
use std::num::NonZeroU32;

type AccessPointLimiter = GovRateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

const FALLBACK_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(120) {
    Some(n) => n,
    None => unreachable!(),
};

/// Shared limiter keyed by access point identifier.
pub struct RateLimiterState {
    limiter: AccessPointLimiter,
    clock: DefaultClock,
    per_minute: u32,
}

impl RateLimiterState {
    pub fn new(per_minute: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(FALLBACK_PER_MINUTE));
        Self {
            limiter: GovRateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            per_minute,
        }
    }

    /// `Ok(())` when the access point may scan, otherwise the seconds to wait.
    pub fn check(&self, access_point: &str) -> Result<(), u64> {
        match self.limiter.check_key(&access_point.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                Err(wait.as_secs().max(1))
            }
        }
    }

    /// Drops state for access points that are back at full quota.
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }

    pub fn tracked_access_points(&self) -> usize {
        self.limiter.len()
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }
}

impl std::fmt::Debug for RateLimiterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterState")
            .field("per_minute", &self.per_minute)
            .field("tracked_access_points", &self.tracked_access_points())
            .finish()
    }
}
