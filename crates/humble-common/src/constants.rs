//! Shared constants for the contact gate.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Submissions allowed per IP within one window
pub const MAX_SUBMISSIONS_PER_WINDOW: u32 = 5;

/// Rate limit window, measured from the first submission (1 hour)
pub const RATE_LIMIT_WINDOW_SECS: u64 = 3600;

/// Longest window a configuration may ask for (one year)
pub const MAX_RATE_LIMIT_WINDOW_SECS: u64 = 366 * 24 * 3600;

/// Unused math challenges are purged after this long (10 minutes)
pub const MATH_CHALLENGE_TTL_SECS: u64 = 600;

/// Minimum score accepted from the external verification service
pub const MIN_CAPTCHA_SCORE: f64 = 0.5;

/// Placeholder secret shipped in sample configs; treated as "not configured"
pub const PLACEHOLDER_CAPTCHA_SECRET: &str = "your_secret_key_here";

/// Default score verification endpoint
pub const DEFAULT_CAPTCHA_VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";

/// Visitor session lifetime in the session store (30 minutes)
pub const SESSION_TTL_SECS: u64 = 1800;

/// How often the background sweeper purges expired rate limit records (15 minutes)
pub const SWEEP_INTERVAL_SECS: u64 = 900;

/// Redis key prefixes
pub mod redis_keys {
    /// Rate limit record: ratelimit:{ip_address}
    pub const RATELIMIT_PREFIX: &str = "ratelimit:";

    /// Set of IPs with a live rate limit record
    pub const RATELIMIT_INDEX: &str = "ratelimit:index";

    /// Visitor session values: session:{session_id}:{key}
    pub const SESSION_PREFIX: &str = "session:";
}

/// Session keys
pub mod session_keys {
    /// Map of outstanding math challenges for one visitor
    pub const MATH_CHALLENGES: &str = "math_challenges";
}

/// HTTP header and cookie names
pub mod headers {
    /// Client address as reported by the reverse proxy
    pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";

    /// Visitor session cookie
    pub const SESSION_COOKIE: &str = "gatehouse_sid";
}
