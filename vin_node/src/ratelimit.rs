//! Per-client token-bucket rate limiting.
//!
//! Each client key owns a bucket with a burst capacity and a sustained
//! refill rate, refilled in whole one-second ticks. The client key comes
//! from `X-Forwarded-For` (first value), then `X-Real-Ip`, then a
//! non-cryptographic fingerprint of `User-Agent` + `Accept-Language` so
//! anonymous clients still share a bucket. Buckets idle for over an hour
//! are swept opportunistically.

use http::HeaderMap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

pub const DEFAULT_BURST: u32 = 100;
pub const DEFAULT_PER_SECOND: u32 = 10;

const REFILL_TICK: Duration = Duration::from_secs(1);
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const IDLE_EVICT: Duration = Duration::from_secs(3600);

struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    burst: u32,
    per_second: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(burst: u32, per_second: u32) -> Self {
        Self {
            burst,
            per_second,
            buckets: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Refills the client's bucket for elapsed ticks, then takes one token.
    /// `false` means the client is over its rate.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        self.maybe_sweep(now);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_seen: now,
        });

        let ticks = now.saturating_duration_since(bucket.last_refill).as_secs() as u32;
        if ticks > 0 {
            let refill = ticks.saturating_mul(self.per_second);
            bucket.tokens = bucket.tokens.saturating_add(refill).min(self.burst);
            bucket.last_refill += REFILL_TICK * ticks;
        }
        bucket.last_seen = now;

        if bucket.tokens == 0 {
            false
        } else {
            bucket.tokens -= 1;
            true
        }
    }

    fn maybe_sweep(&self, now: Instant) {
        let mut last_sweep = self.last_sweep.lock();
        if now.saturating_duration_since(*last_sweep) < SWEEP_INTERVAL {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);

        self.buckets
            .lock()
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < IDLE_EVICT);
    }

    /// Derives the client key from request headers.
    pub fn client_key(headers: &HeaderMap) -> String {
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = header_str(headers, "x-real-ip") {
            return real_ip.to_string();
        }

        let ua = header_str(headers, "user-agent").unwrap_or("");
        let lang = header_str(headers, "accept-language").unwrap_or("");
        format!("fp:{:016x}", fnv1a(format!("{ua}|{lang}").as_bytes()))
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// FNV-1a; a stable, non-cryptographic fingerprint.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
