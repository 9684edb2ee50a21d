//! Maintenance sweeper for expired rate limit records.
//!
//! Safe to run next to live traffic: it only removes records whose window
//! has already passed.

use humble_common::GateError;
use std::sync::Arc;
use std::time::Duration;

use crate::ratelimit::RateLimitStore;

/// Purges expired rate limit records
#[derive(Clone)]
pub struct MaintenanceSweeper {
    store: Arc<dyn RateLimitStore>,
}

impl MaintenanceSweeper {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// One sweep; returns the number of records deleted
    pub async fn run_once(&self) -> Result<u64, GateError> {
        match self.store.sweep_expired().await {
            Ok(deleted) => Ok(deleted),
            Err(e) => {
                tracing::error!(error = %e, "Error cleaning up expired rate limit entries");
                Err(e)
            }
        }
    }
}

/// Background loop: sweep every `interval` until shutdown
pub async fn sweeper_worker(
    sweeper: MaintenanceSweeper,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tracing::info!(interval_secs = interval.as_secs(), "Rate limit sweeper started");

    let mut ticker = tokio::time::interval(interval);
    // First tick fires immediately; skip it so startup stays cheap
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Failures are already logged, try again next tick
                let _ = sweeper.run_once().await;
            }
            _ = shutdown.recv() => {
                tracing::info!("Rate limit sweeper shutting down");
                break;
            }
        }
    }
}
