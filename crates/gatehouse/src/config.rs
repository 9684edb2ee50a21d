//! Configuration management for Gatehouse.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use humble_common::constants::{
    DEFAULT_CAPTCHA_VERIFY_URL, DEFAULT_LISTEN_ADDR, DEFAULT_REDIS_URL, MATH_CHALLENGE_TTL_SECS,
    MAX_RATE_LIMIT_WINDOW_SECS, MAX_SUBMISSIONS_PER_WINDOW, MIN_CAPTCHA_SCORE,
    RATE_LIMIT_WINDOW_SECS, SESSION_TTL_SECS, SWEEP_INTERVAL_SECS,
};
use humble_common::RateLimitPolicy;

use crate::captcha::CaptchaPolicy;

/// Where rate limit records and sessions live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Redis (persistent, shared between processes)
    Redis,
    /// Process memory (development only)
    Memory,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Storage backend for rate limits and sessions
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,

    /// Take the client IP from X-Forwarded-For (only behind a trusted proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// CAPTCHA configuration
    #[serde(default)]
    pub captcha: CaptchaConfig,

    /// Email delivery configuration
    #[serde(default)]
    pub mail: MailConfig,

    /// Visitor session configuration
    #[serde(default)]
    pub session: SessionConfig,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Submissions allowed per IP per window
    #[serde(default = "default_max_submissions")]
    pub max_submissions: u32,

    /// Window length in seconds, measured from the first submission
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Background sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_submissions: default_max_submissions(),
            window_secs: default_window(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl RateLimitConfig {
    pub fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy::new(self.max_submissions, self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// CAPTCHA-specific configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaConfig {
    /// Server-side secret for the score service (empty disables it)
    #[serde(default)]
    pub secret_key: String,

    /// Public site key handed to the contact page
    #[serde(default)]
    pub site_key: String,

    /// Score verification endpoint
    #[serde(default = "default_verify_url")]
    pub verify_url: String,

    /// Lowest accepted score
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Timeout for one verification call in milliseconds
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_ms: u64,

    /// Math challenge validity in seconds
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            site_key: String::new(),
            verify_url: default_verify_url(),
            min_score: default_min_score(),
            verify_timeout_ms: default_verify_timeout(),
            challenge_ttl_secs: default_challenge_ttl(),
        }
    }
}

impl CaptchaConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }

    pub fn policy(&self) -> CaptchaPolicy {
        CaptchaPolicy {
            min_score: self.min_score,
            challenge_ttl_secs: self.challenge_ttl_secs,
            verify_timeout: self.verify_timeout(),
        }
    }
}

/// Email delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    /// Address that receives business notifications
    #[serde(default = "default_business_email")]
    pub business_email: String,

    /// Sender address for outgoing mail
    #[serde(default = "default_business_email")]
    pub from_email: String,

    /// HTTP mail relay; mail is only logged when unset
    #[serde(default)]
    pub relay_url: Option<String>,

    /// Timeout for delivering both messages of one submission, in seconds
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            business_email: default_business_email(),
            from_email: default_business_email(),
            relay_url: None,
            timeout_secs: default_delivery_timeout(),
        }
    }
}

impl MailConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Visitor session configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle lifetime of a session in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Mark the session cookie `Secure`
    #[serde(default)]
    pub secure_cookie: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            secure_cookie: false,
        }
    }
}

// Default value functions
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_storage() -> StorageBackend { StorageBackend::Redis }
fn default_max_submissions() -> u32 { MAX_SUBMISSIONS_PER_WINDOW }
fn default_window() -> u64 { RATE_LIMIT_WINDOW_SECS }
fn default_sweep_interval() -> u64 { SWEEP_INTERVAL_SECS }
fn default_verify_url() -> String { DEFAULT_CAPTCHA_VERIFY_URL.to_string() }
fn default_min_score() -> f64 { MIN_CAPTCHA_SCORE }
fn default_verify_timeout() -> u64 { 5_000 }
fn default_challenge_ttl() -> u64 { MATH_CHALLENGE_TTL_SECS }
fn default_business_email() -> String { "hello@humblewizards.com".to_string() }
fn default_delivery_timeout() -> u64 { 15 }
fn default_session_ttl() -> u64 { SESSION_TTL_SECS }

impl AppConfig {
    /// Load configuration from file, with CLI overrides
    pub fn load(config_path: &str, args: &super::Args) -> Result<Self> {
        if !Path::new(config_path).exists() {
            // Every field has a default
            tracing::warn!("Config file not found, using defaults");
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("GATEHOUSE").separator("__"))
            .build()
            .context("Failed to load config file")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref redis_url) = args.redis_url {
            config.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = args.listen {
            config.listen_addr = listen.clone();
        }
        if let Some(storage) = args.storage {
            config.storage = storage;
        }
        if let Some(ref secret) = args.captcha_secret {
            config.captcha.secret_key = secret.clone();
        }
        if let Some(ref relay) = args.mail_relay_url {
            config.mail.relay_url = Some(relay.clone());
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limit.max_submissions == 0 {
            anyhow::bail!("rate_limit.max_submissions must be at least 1");
        }
        if !(1..=MAX_RATE_LIMIT_WINDOW_SECS).contains(&self.rate_limit.window_secs) {
            anyhow::bail!(
                "rate_limit.window_secs must be within 1..={}",
                MAX_RATE_LIMIT_WINDOW_SECS
            );
        }
        if !(1..=MAX_RATE_LIMIT_WINDOW_SECS).contains(&self.captcha.challenge_ttl_secs) {
            anyhow::bail!(
                "captcha.challenge_ttl_secs must be within 1..={}",
                MAX_RATE_LIMIT_WINDOW_SECS
            );
        }
        if !(0.0..=1.0).contains(&self.captcha.min_score) {
            anyhow::bail!("captcha.min_score must be within 0.0..=1.0");
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            listen_addr: default_listen_addr(),
            storage: default_storage(),
            trust_forwarded_for: false,
            rate_limit: RateLimitConfig::default(),
            captcha: CaptchaConfig::default(),
            mail: MailConfig::default(),
            session: SessionConfig::default(),
        }
    }
}
