//! Rate limit records persisted in Redis.
//!
//! Layout: `ratelimit:{ip}` holds the JSON record, `ratelimit:index` is the
//! set of IPs with a record so the sweeper can find them without `KEYS`.
//!
//! Every write is a compare-and-set against the value that was read, done
//! server-side in Lua. Lost races are retried, so concurrent submissions
//! from one IP are all counted.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use humble_common::constants::redis_keys::{RATELIMIT_INDEX, RATELIMIT_PREFIX};
use humble_common::{GateError, RateLimitPolicy, RateLimitRecord};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::RateLimitStore;
use crate::clock::Clock;

/// Writes the new record only if the key still holds what we read
/// (`ARGV[1]` empty means "absent").
const SET_IF_UNCHANGED: &str = r"
local current = redis.call('GET', KEYS[1])
if (current == false and ARGV[1] == '') or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    redis.call('SADD', KEYS[2], ARGV[3])
    return 1
end
return 0
";

/// Deletes a record only if it still holds the value we judged expired,
/// so a concurrent reset is never thrown away.
const DELETE_IF_UNCHANGED: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
return 0
";

/// Compare-and-set rounds before giving up on a hot key
const MAX_WRITE_ATTEMPTS: usize = 32;

/// What the stored value for one IP amounts to at a given instant
#[derive(Debug)]
enum Slot {
    Missing,
    Live { raw: String, record: RateLimitRecord },
    Expired { raw: String, record: RateLimitRecord },
    /// Value that no longer decodes; handled like an expired record
    Corrupt { raw: String },
}

impl Slot {
    fn classify(raw: Option<String>, now: DateTime<Utc>, window: Duration) -> Self {
        let Some(raw) = raw else {
            return Self::Missing;
        };

        match serde_json::from_str::<RateLimitRecord>(&raw) {
            Ok(record) if record.is_expired(now, window) => Self::Expired { raw, record },
            Ok(record) => Self::Live { raw, record },
            Err(_) => Self::Corrupt { raw },
        }
    }

    /// Value a compare-and-set must find in place, empty for "absent"
    fn raw(&self) -> &str {
        match self {
            Self::Missing => "",
            Self::Live { raw, .. } | Self::Expired { raw, .. } | Self::Corrupt { raw } => raw,
        }
    }

    /// Stale value to delete, if any
    fn stale(&self) -> Option<&str> {
        match self {
            Self::Expired { raw, .. } | Self::Corrupt { raw } => Some(raw),
            Self::Missing | Self::Live { .. } => None,
        }
    }

    /// The record after one more submission
    fn next_record(self, ip: &str, now: DateTime<Utc>, window: Duration) -> RateLimitRecord {
        match self {
            Self::Live { mut record, .. } | Self::Expired { mut record, .. } => {
                record.register_submission(now, window);
                record
            }
            Self::Missing | Self::Corrupt { .. } => RateLimitRecord::new(ip, now),
        }
    }
}

/// Redis-backed rate limit store
pub struct RedisRateLimitStore {
    redis: ConnectionManager,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
}

fn record_key(ip: &str) -> String {
    format!("{}{}", RATELIMIT_PREFIX, ip)
}

fn unavailable(err: redis::RedisError) -> GateError {
    GateError::StoreUnavailable(err.to_string())
}

impl RedisRateLimitStore {
    pub fn new(redis: ConnectionManager, policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            redis,
            policy,
            clock,
        }
    }

    async fn read(&self, ip: &str, now: DateTime<Utc>) -> Result<Slot, GateError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(record_key(ip)).await.map_err(unavailable)?;

        let slot = Slot::classify(raw, now, self.policy.window);
        if let Slot::Corrupt { .. } = slot {
            warn!(ip_address = %ip, "Unreadable rate limit entry, treating as expired");
        }
        Ok(slot)
    }

    async fn set_if_unchanged(&self, ip: &str, seen: &str, data: &str) -> Result<bool, GateError> {
        let mut conn = self.redis.clone();
        let written: i64 = redis::Script::new(SET_IF_UNCHANGED)
            .key(record_key(ip))
            .key(RATELIMIT_INDEX)
            .arg(seen)
            .arg(data)
            .arg(ip)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(written == 1)
    }

    /// Remove a stale record unless someone rewrote it in the meantime
    async fn remove_if_unchanged(&self, ip: &str, seen: &str) -> Result<bool, GateError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(DELETE_IF_UNCHANGED)
            .key(record_key(ip))
            .key(RATELIMIT_INDEX)
            .arg(seen)
            .arg(ip)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(deleted == 1)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    async fn find(&self, ip: &str) -> Result<Option<RateLimitRecord>, GateError> {
        match self.read(ip, self.clock.now()).await? {
            Slot::Live { record, .. } | Slot::Expired { record, .. } => Ok(Some(record)),
            Slot::Missing | Slot::Corrupt { .. } => Ok(None),
        }
    }

    async fn is_limited(&self, ip: &str) -> Result<bool, GateError> {
        let now = self.clock.now();
        let slot = self.read(ip, now).await?;

        if let Some(stale) = slot.stale() {
            if self.remove_if_unchanged(ip, stale).await? {
                info!(ip_address = %ip, "Removed expired rate limit entry");
            }
            return Ok(false);
        }

        let Slot::Live { record, .. } = slot else {
            return Ok(false);
        };

        let limited = self.policy.is_limited(&record, now);
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
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let slot = self.read(ip, now).await?;
            let seen = slot.raw().to_string();

            if let Slot::Missing = slot {
                debug!(ip_address = %ip, "Creating new rate limit entry");
            }

            let record = slot.next_record(ip, now, self.policy.window);
            let data = serde_json::to_string(&record)?;

            if self.set_if_unchanged(ip, &seen, &data).await? {
                info!(
                    ip_address = %ip,
                    submission_count = record.submission_count,
                    "Updated rate limit entry"
                );
                return Ok(record);
            }

            debug!(ip_address = %ip, attempt, "Rate limit entry changed concurrently, retrying");
        }

        Err(GateError::StoreUnavailable(format!(
            "rate limit entry for {ip} kept changing after {MAX_WRITE_ATTEMPTS} attempts"
        )))
    }

    async fn sweep_expired(&self) -> Result<u64, GateError> {
        let now = self.clock.now();
        let mut conn = self.redis.clone();
        let ips: Vec<String> = conn.smembers(RATELIMIT_INDEX).await.map_err(unavailable)?;

        let mut deleted = 0u64;
        for ip in ips {
            let slot = match self.read(&ip, now).await {
                Ok(slot) => slot,
                Err(e) => {
                    warn!(ip_address = %ip, error = %e, "Skipping rate limit entry during sweep");
                    continue;
                }
            };

            if let Some(stale) = slot.stale() {
                match self.remove_if_unchanged(&ip, stale).await {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(ip_address = %ip, error = %e, "Could not remove rate limit entry");
                    }
                }
            } else if let Slot::Missing = slot {
                // Index entry without a record
                let _: () = conn.srem(RATELIMIT_INDEX, &ip).await.map_err(unavailable)?;
            }
        }

        info!(deleted_count = deleted, "Cleaned up expired rate limit entries");
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), GateError> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
