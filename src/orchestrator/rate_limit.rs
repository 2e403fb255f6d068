//! Per-tenant token bucket. Capacity is the burst limit; tokens refill at
//! `requests_per_minute / 60` per second.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(requests_per_minute: u32, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            refill_per_sec: f64::from(requests_per_minute) / 60.0,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)configure a tenant's bucket. The bucket starts full.
    pub async fn configure(&self, tenant_id: &str, requests_per_minute: u32, burst: u32) {
        self.buckets
            .lock()
            .await
            .insert(tenant_id.to_string(), Bucket::new(requests_per_minute, burst));
    }

    /// Take one token. Tenants without a bucket are unlimited.
    pub async fn try_acquire(&self, tenant_id: &str) -> bool {
        match self.buckets.lock().await.get_mut(tenant_id) {
            Some(bucket) => bucket.try_take(),
            None => true,
        }
    }

    pub async fn remove(&self, tenant_id: &str) {
        self.buckets.lock().await.remove(tenant_id);
    }

    pub async fn clear(&self) {
        self.buckets.lock().await.clear();
    }
}
