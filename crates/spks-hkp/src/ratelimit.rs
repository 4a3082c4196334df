//! Per-remote-address token buckets for key submissions.
//!
//! Buckets refill at `P minutes / R` per token with a burst of `R`, so
//! over any window of `P` minutes a fixed remote gets at most `R`
//! accepted submissions. A sweeper drops buckets that have been idle for
//! a full refill period, keeping the table bounded without resetting
//! state for active clients.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use anyhow::Context;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;

/// Parse a `"R/P"` rate limit description (R requests per P minutes).
///
/// The empty string disables limiting and yields `None`; so do zero
/// values, matching a configured-but-unlimited setup.
pub fn parse_rate_limit(limit: &str) -> anyhow::Result<Option<(u32, u32)>> {
    if limit.is_empty() {
        return Ok(None);
    }
    let (requests, minutes) = limit
        .split_once('/')
        .filter(|(_, minutes)| !minutes.contains('/'))
        .with_context(|| format!("rate limit must be of the form 1/1 not {limit}"))?;
    let requests: u32 = requests
        .trim()
        .parse()
        .context("while parsing rate limit request")?;
    let minutes: u32 = minutes
        .trim()
        .parse()
        .context("while parsing rate limit minute")?;
    if requests == 0 || minutes == 0 {
        // configured but unlimited
        return Ok(None);
    }
    Ok(Some((requests, minutes)))
}

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    last_push: Instant,
}

/// Token-bucket table keyed by remote address.
pub struct PushLimiter {
    quota: Quota,
    /// Full refill period: P minutes.
    period: Duration,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
}

impl PushLimiter {
    /// Build a limiter allowing `requests` per `minutes` with a burst of
    /// `requests`. Zero values yield `None`.
    pub fn new(requests: u32, minutes: u32) -> Option<PushLimiter> {
        let burst = NonZeroU32::new(requests)?;
        if minutes == 0 {
            return None;
        }
        let period = Duration::from_secs(u64::from(minutes) * 60);
        let quota = Quota::with_period(period / requests)?.allow_burst(burst);
        Some(PushLimiter {
            quota,
            period,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// Reserve one token for the address; `true` when the budget is
    /// exhausted. The table lock is held only across the bucket lookup
    /// and the reservation.
    pub fn push_limit_reached(&self, addr: IpAddr) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(addr).or_insert_with(|| Bucket {
            limiter: RateLimiter::direct(self.quota),
            last_push: Instant::now(),
        });
        bucket.last_push = Instant::now();
        bucket.limiter.check().is_err()
    }

    /// Drop buckets that have been idle for at least one full refill
    /// period; they are indistinguishable from fresh ones.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_push) < self.period);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
    }

    #[test]
    fn parse_accepts_the_r_slash_p_form() {
        assert_eq!(parse_rate_limit("").unwrap(), None);
        assert_eq!(parse_rate_limit("2/1").unwrap(), Some((2, 1)));
        assert_eq!(parse_rate_limit("100/5").unwrap(), Some((100, 5)));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(parse_rate_limit("2").is_err());
        assert!(parse_rate_limit("2/1/1").is_err());
        assert!(parse_rate_limit("a/1").is_err());
        assert!(parse_rate_limit("1/b").is_err());
    }

    #[test]
    fn zero_values_disable_limiting() {
        assert_eq!(parse_rate_limit("0/1").unwrap(), None);
        assert_eq!(parse_rate_limit("1/0").unwrap(), None);
    }

    #[test]
    fn burst_is_the_request_count() {
        let limiter = PushLimiter::new(2, 1).unwrap();
        assert!(!limiter.push_limit_reached(addr(1)));
        assert!(!limiter.push_limit_reached(addr(1)));
        assert!(limiter.push_limit_reached(addr(1)));
    }

    #[test]
    fn addresses_have_independent_buckets() {
        let limiter = PushLimiter::new(1, 1).unwrap();
        assert!(!limiter.push_limit_reached(addr(1)));
        assert!(limiter.push_limit_reached(addr(1)));
        assert!(!limiter.push_limit_reached(addr(2)));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn sweep_drops_idle_buckets_and_keeps_active_ones() {
        let limiter = PushLimiter::new(2, 1).unwrap();
        limiter.push_limit_reached(addr(1));
        assert_eq!(limiter.bucket_count(), 1);

        // just pushed, not yet caught up
        limiter.sweep_at(Instant::now());
        assert_eq!(limiter.bucket_count(), 1);

        // a full refill period later the bucket is gone
        limiter.sweep_at(Instant::now() + Duration::from_secs(60));
        assert_eq!(limiter.bucket_count(), 0);
    }
}
