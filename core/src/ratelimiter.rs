//! Per-address token buckets.
//!
//! Each address gets a bucket holding `per_minute` tokens that refills at
//! `per_minute` tokens per minute, so a caller can spend a whole minute's
//! allowance at once. Buckets are created on first use and the whole map is
//! dropped by [`RateLimiter::reset`]. Resetting forgets the state of callers
//! that are still active; that coarseness is accepted to keep memory bounded
//! without tracking idle time per entry.

use governor::{DefaultDirectRateLimiter, Quota};
use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Arc, PoisonError, RwLock};

pub struct RateLimiter {
    quota: Quota,
    buckets: RwLock<HashMap<IpAddr, Arc<DefaultDirectRateLimiter>>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        let per_minute = NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        RateLimiter {
            quota: Quota::per_minute(per_minute),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Take one token for `ip`. Returns false when the bucket is empty.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.bucket(ip).check().is_ok()
    }

    fn bucket(&self, ip: IpAddr) -> Arc<DefaultDirectRateLimiter> {
        {
            let map = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(b) = map.get(&ip) {
                return b.clone();
            }
        }
        let mut map = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(ip)
            .or_insert_with(|| Arc::new(DefaultDirectRateLimiter::direct(self.quota)))
            .clone()
    }

    /// Forget every bucket; all addresses start again with a full allowance.
    pub fn reset(&self) {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn tracked(&self) -> usize {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
