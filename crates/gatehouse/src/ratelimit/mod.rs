//! Per-IP submission rate limiting.
//!
//! Each IP gets a counter with a fixed window that opens on its first
//! submission. Once the window has passed the record is logically expired:
//! limit checks delete it lazily and the maintenance sweeper purges the rest.

mod memory;
mod redis_store;

pub use memory::MemoryRateLimitStore;
pub use redis_store::RedisRateLimitStore;

use async_trait::async_trait;
use humble_common::{GateError, RateLimitPolicy, RateLimitRecord};

/// Persistence for rate limit records.
///
/// Storage failures are reported as [`GateError::StoreUnavailable`]; callers
/// pick the fallback policy.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Threshold and window this store enforces
    fn policy(&self) -> RateLimitPolicy;

    /// Raw lookup, expired or not
    async fn find(&self, ip: &str) -> Result<Option<RateLimitRecord>, GateError>;

    /// True iff a live record for `ip` has reached the threshold.
    /// Expired records are deleted as a side effect.
    async fn is_limited(&self, ip: &str) -> Result<bool, GateError>;

    /// Count one real submission from `ip`
    async fn record_submission(&self, ip: &str) -> Result<RateLimitRecord, GateError>;

    /// Delete every expired record, returning how many were removed
    async fn sweep_expired(&self) -> Result<u64, GateError>;

    /// Backend health check
    async fn ping(&self) -> Result<(), GateError> {
        Ok(())
    }
}
