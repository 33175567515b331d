//! Token-bucket throttle per scanning device.

use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use tracing::debug;

/// A bucket untouched this long has refilled completely and can be dropped.
const IDLE_AFTER: Duration = Duration::from_secs(1);

/// Past this many tracked devices, idle buckets are swept on the next check.
const SWEEP_THRESHOLD: usize = 10_000;

/// Bucket shared by scans that did not identify their device.
pub const ANONYMOUS_DEVICE: &str = "-";

struct DeviceBucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    last_access: Instant,
}

impl DeviceBucket {
    fn new(quota: Quota) -> Self {
        Self {
            limiter: RateLimiter::direct(quota),
            last_access: Instant::now(),
        }
    }

    fn check(&mut self) -> Result<(), Duration> {
        self.last_access = Instant::now();
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }
}

pub struct DeviceRateLimiter {
    quota: Quota,
    buckets: DashMap<String, DeviceBucket>,
}

impl DeviceRateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(max_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            quota: Quota::per_second(per_second),
            buckets: DashMap::new(),
        }
    }

    /// Counts one attempt. Returns how long to back off when over the limit.
    pub fn check(&self, device_id: Option<&str>) -> Result<(), Duration> {
        if self.buckets.len() > SWEEP_THRESHOLD {
            self.sweep(IDLE_AFTER);
        }

        let key = device_id.unwrap_or(ANONYMOUS_DEVICE);
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| DeviceBucket::new(self.quota));
        bucket.check()
    }

    /// Drops buckets idle for at least `max_idle`.
    pub fn sweep(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets.retain(|device_id, bucket| {
            let idle = now.saturating_duration_since(bucket.last_access);
            if idle >= max_idle {
                debug!(%device_id, "Dropping idle rate limit bucket");
                false
            } else {
                true
            }
        });
    }

    pub fn tracked_devices(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_applies_per_device() {
        let limiter = DeviceRateLimiter::new(2);

        assert!(limiter.check(Some("gate-1")).is_ok());
        assert!(limiter.check(Some("gate-1")).is_ok());
        assert!(limiter.check(Some("gate-1")).is_err());
        assert!(limiter.check(Some("gate-2")).is_ok());
    }

    #[test]
    fn test_backoff_is_at_most_one_refill() {
        let limiter = DeviceRateLimiter::new(1);

        assert!(limiter.check(Some("gate-1")).is_ok());
        let backoff = limiter.check(Some("gate-1")).unwrap_err();
        assert!(backoff > Duration::ZERO);
        assert!(backoff <= Duration::from_secs(1));
    }

    #[test]
    fn test_bucket_refills() {
        let limiter = DeviceRateLimiter::new(20);
        for _ in 0..20 {
            assert!(limiter.check(Some("gate-1")).is_ok());
        }
        assert!(limiter.check(Some("gate-1")).is_err());

        std::thread::sleep(Duration::from_millis(120));
        assert!(limiter.check(Some("gate-1")).is_ok());
    }

    #[test]
    fn test_anonymous_devices_share_a_bucket() {
        let limiter = DeviceRateLimiter::new(1);

        assert!(limiter.check(None).is_ok());
        assert!(limiter.check(None).is_err());
    }

    #[test]
    fn test_sweep_drops_idle_buckets() {
        let limiter = DeviceRateLimiter::new(5);
        limiter.check(Some("gate-1")).unwrap();
        limiter.check(Some("gate-2")).unwrap();
        assert_eq!(limiter.tracked_devices(), 2);

        limiter.sweep(Duration::from_secs(60));
        assert_eq!(limiter.tracked_devices(), 2);

        limiter.sweep(Duration::ZERO);
        assert_eq!(limiter.tracked_devices(), 0);
    }
}
