//! Process-local rate limit store.

use async_trait::async_trait;
use humble_common::{GateError, RateLimitPolicy, RateLimitRecord};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::RateLimitStore;
use crate::clock::Clock;

/// Rate limit records kept in memory. Lost on restart.
pub struct MemoryRateLimitStore {
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, RateLimitRecord>>,
}

impl MemoryRateLimitStore {
    pub fn new(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records currently held, expired ones included
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    async fn find(&self, ip: &str) -> Result<Option<RateLimitRecord>, GateError> {
        Ok(self.records.read().await.get(ip).cloned())
    }

    async fn is_limited(&self, ip: &str) -> Result<bool, GateError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;

        let Some(record) = records.get(ip) else {
            return Ok(false);
        };

        if record.is_expired(now, self.policy.window) {
            records.remove(ip);
            info!(ip_address = %ip, "Removed expired rate limit entry");
            return Ok(false);
        }

        let limited = self.policy.is_limited(record, now);
        if limited {
            warn!(
                ip_address = %ip,
                submission_count = record.submission_count,
                first_submission = %record.window_start,
                last_submission = %record.last_submission_at,
                "Rate limit exceeded"
            );
        }

        Ok(limited)
    }

    async fn record_submission(&self, ip: &str) -> Result<RateLimitRecord, GateError> {
        let now = self.clock.now();
        let mut records = self.records.write().await;

        let record = match records.get_mut(ip) {
            Some(record) => {
                record.register_submission(now, self.policy.window);
                record.clone()
            }
            None => {
                let record = RateLimitRecord::new(ip, now);
                records.insert(ip.to_string(), record.clone());
                record
            }
        };

        info!(
            ip_address = %ip,
            submission_count = record.submission_count,
            "Updated rate limit entry"
        );

        Ok(record)
    }

    async fn sweep_expired(&self) -> Result<u64, GateError> {
        let now = self.clock.now();
        let window = self.policy.window;
        let mut records = self.records.write().await;

        let before = records.len();
        records.retain(|_, r| !r.is_expired(now, window));
        let deleted = (before - records.len()) as u64;

        info!(deleted_count = deleted, "Cleaned up expired rate limit entries");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn store() -> (Arc<ManualClock>, MemoryRateLimitStore) {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = MemoryRateLimitStore::new(RateLimitPolicy::default(), clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_count_tracks_calls_within_window() {
        let (clock, store) = store();

        for expected in 1..=7u32 {
            let record = store.record_submission("1.2.3.4").await.unwrap();
            assert_eq!(record.submission_count, expected);
            clock.advance(Duration::minutes(5));
        }

        // The store itself never caps the counter
        let record = store.find("1.2.3.4").await.unwrap().unwrap();
        assert_eq!(record.submission_count, 7);
    }

    #[tokio::test]
    async fn test_limited_at_threshold() {
        let (_clock, store) = store();

        for _ in 0..4 {
            store.record_submission("1.2.3.4").await.unwrap();
        }
        assert!(!store.is_limited("1.2.3.4").await.unwrap());

        store.record_submission("1.2.3.4").await.unwrap();
        assert!(store.is_limited("1.2.3.4").await.unwrap());

        // Other IPs are unaffected
        assert!(!store.is_limited("5.6.7.8").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_resets_after_an_hour() {
        let (clock, store) = store();
        let start = clock.now();

        for _ in 0..5 {
            store.record_submission("1.2.3.4").await.unwrap();
        }

        clock.advance(Duration::seconds(3601));
        let record = store.record_submission("1.2.3.4").await.unwrap();
        assert_eq!(record.submission_count, 1);
        assert_eq!(record.window_start, start + Duration::seconds(3601));
    }

    #[tokio::test]
    async fn test_expired_record_deleted_on_check() {
        let (clock, store) = store();

        for _ in 0..5 {
            store.record_submission("1.2.3.4").await.unwrap();
        }
        clock.advance(Duration::minutes(61));

        assert!(!store.is_limited("1.2.3.4").await.unwrap());
        assert!(store.find("1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (clock, store) = store();

        store.record_submission("10.0.0.1").await.unwrap();
        store.record_submission("10.0.0.2").await.unwrap();
        clock.advance(Duration::minutes(45));
        store.record_submission("10.0.0.3").await.unwrap();
        clock.advance(Duration::minutes(20));

        assert_eq!(store.sweep_expired().await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
        assert!(store.find("10.0.0.3").await.unwrap().is_some());

        // Idempotent
        assert_eq!(store.sweep_expired().await.unwrap(), 0);
    }
}
