//! Application state and shared resources.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::captcha::{CaptchaVerifier, RecaptchaClient, ScoreService};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, StorageBackend};
use crate::gate::ContactGate;
use crate::mail::{ContactMailer, LogMailer, Mailer, WebhookMailer};
use crate::ratelimit::{MemoryRateLimitStore, RateLimitStore, RedisRateLimitStore};
use crate::session::{MemorySessionStore, RedisSessionStore, SessionStore};
use crate::sweeper::MaintenanceSweeper;
use crate::validation::ContactFormValidator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Submission pipeline
    pub gate: Arc<ContactGate>,

    /// Rate limit records (also used for readiness)
    pub store: Arc<dyn RateLimitStore>,

    /// Expired record cleanup
    pub sweeper: MaintenanceSweeper,

    /// Outgoing contact mail
    pub mailer: Arc<ContactMailer>,

    pub clock: Arc<dyn Clock>,
}

/// Swappable collaborators the state is assembled from
pub struct Components {
    pub store: Arc<dyn RateLimitStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub score: Arc<dyn ScoreService>,
    pub transport: Arc<dyn Mailer>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create new application state, connecting to Redis when selected
    pub async fn new(config: AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let policy = config.rate_limit.policy();

        let (store, sessions): (Arc<dyn RateLimitStore>, Arc<dyn SessionStore>) =
            match config.storage {
                StorageBackend::Redis => {
                    // Connection manager handles reconnection
                    let client = redis::Client::open(config.redis_url.as_str())
                        .context("Failed to create Redis client")?;
                    let redis = ConnectionManager::new(client)
                        .await
                        .context("Failed to connect to Redis")?;

                    (
                        Arc::new(RedisRateLimitStore::new(redis.clone(), policy, clock.clone())),
                        Arc::new(RedisSessionStore::new(redis, config.session.ttl_secs)),
                    )
                }
                StorageBackend::Memory => {
                    tracing::warn!("Using in-memory storage, rate limits reset on restart");
                    (
                        Arc::new(MemoryRateLimitStore::new(policy, clock.clone())),
                        Arc::new(MemorySessionStore::new(config.session.ttl_secs)),
                    )
                }
            };

        let score = Arc::new(
            RecaptchaClient::new(
                config.captcha.secret_key.clone(),
                config.captcha.verify_url.clone(),
                config.captcha.verify_timeout(),
            )
            .context("Failed to build score service client")?,
        );
        if !score.is_configured() {
            tracing::warn!("reCAPTCHA secret not configured, using math challenges only");
        }

        let transport: Arc<dyn Mailer> = match config.mail.relay_url {
            Some(ref url) => Arc::new(
                WebhookMailer::new(
                    url.clone(),
                    config.mail.from_email.clone(),
                    config.mail.timeout(),
                )
                .context("Failed to build mail relay client")?,
            ),
            None => {
                tracing::warn!("No mail relay configured, messages will only be logged");
                Arc::new(LogMailer)
            }
        };

        Ok(Self::from_components(
            config,
            Components {
                store,
                sessions,
                score,
                transport,
                clock,
            },
        ))
    }

    /// Wire the service graph from already-built collaborators
    pub fn from_components(config: AppConfig, components: Components) -> Self {
        let Components {
            store,
            sessions,
            score,
            transport,
            clock,
        } = components;

        let captcha = Arc::new(CaptchaVerifier::new(
            score,
            sessions,
            clock.clone(),
            config.captcha.policy(),
        ));
        let mailer = Arc::new(ContactMailer::new(
            transport,
            config.mail.business_email.clone(),
        ));
        let gate = Arc::new(ContactGate::new(
            store.clone(),
            captcha,
            Arc::new(ContactFormValidator),
            mailer.clone(),
            clock.clone(),
            config.mail.timeout(),
        ));
        let sweeper = MaintenanceSweeper::new(store.clone());

        Self {
            config,
            gate,
            store,
            sweeper,
            mailer,
            clock,
        }
    }
}
