//! Core types shared across gate components.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{
    MAX_RATE_LIMIT_WINDOW_SECS, MAX_SUBMISSIONS_PER_WINDOW, RATE_LIMIT_WINDOW_SECS,
};

/// Submission threshold and window length for per-IP rate limiting.
///
/// The window is fixed: it starts at the first submission of a record and
/// does not slide with later submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_submissions: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    /// `window_secs` is capped at [`MAX_RATE_LIMIT_WINDOW_SECS`]
    pub fn new(max_submissions: u32, window_secs: u64) -> Self {
        let secs = window_secs.min(MAX_RATE_LIMIT_WINDOW_SECS);
        Self {
            max_submissions,
            window: Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)),
        }
    }

    /// True if the record is live and has used up its quota
    pub fn is_limited(&self, record: &RateLimitRecord, now: DateTime<Utc>) -> bool {
        !record.is_expired(now, self.window) && record.submission_count >= self.max_submissions
    }

    /// Submissions left for a record, `max_submissions` when absent or expired
    pub fn remaining(&self, record: Option<&RateLimitRecord>, now: DateTime<Utc>) -> u32 {
        match record {
            Some(r) if !r.is_expired(now, self.window) => {
                self.max_submissions.saturating_sub(r.submission_count)
            }
            _ => self.max_submissions,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(MAX_SUBMISSIONS_PER_WINDOW, RATE_LIMIT_WINDOW_SECS)
    }
}

/// Per-IP submission counter as persisted by a rate limit store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Client IP address (unique key)
    pub ip_address: String,

    /// Submissions within the current window
    pub submission_count: u32,

    /// Start of the current window (first submission)
    #[serde(rename = "first_submission_at")]
    pub window_start: DateTime<Utc>,

    pub last_submission_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitRecord {
    /// A fresh record for a first submission
    pub fn new(ip_address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            ip_address: ip_address.into(),
            submission_count: 1,
            window_start: now,
            last_submission_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// End of the current window
    pub fn window_end(&self, window: Duration) -> DateTime<Utc> {
        self.window_start + window
    }

    /// A record is expired once a full window has passed since `window_start`
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now >= self.window_end(window)
    }

    /// Account for one more submission: increment inside the window, reset after it
    pub fn register_submission(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.is_expired(now, window) {
            self.submission_count = 1;
            self.window_start = now;
        } else {
            self.submission_count += 1;
        }
        self.last_submission_at = now;
        self.updated_at = now;
    }
}

/// Arithmetic operators used by math challenges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOperator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
}

impl MathOperator {
    pub fn symbol(&self) -> char {
        match self {
            Self::Add => '+',
            Self::Subtract => '-',
            Self::Multiply => '*',
        }
    }

    pub fn apply(&self, a: i64, b: i64) -> i64 {
        match self {
            Self::Add => a + b,
            Self::Subtract => a - b,
            Self::Multiply => a * b,
        }
    }
}

/// A challenge as handed to the page. The answer stays server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedChallenge {
    /// Opaque single-use challenge ID
    pub challenge_id: String,

    /// Human-readable question, e.g. "What is 3 + 4?"
    pub question: String,

    /// Expected answer (server-side only, not sent to client)
    #[serde(skip_serializing, default)]
    pub answer: i64,
}

/// Optional service the visitor is asking about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// Engineering leadership coaching
    Coaching,
    /// Software/hardware project assistance
    Project,
}

impl ServiceType {
    /// Blank means "general inquiry"; anything else must name a service
    fn deserialize_optional<'de, D>(deserializer: D) -> Result<Option<Self>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "" => Ok(None),
                "coaching" => Ok(Some(Self::Coaching)),
                "project" => Ok(Some(Self::Project)),
                _ => Err(serde::de::Error::unknown_variant(
                    &value,
                    &["coaching", "project"],
                )),
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Coaching => "Coaching",
            Self::Project => "Project",
        }
    }
}

/// Contact form payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "ServiceType::deserialize_optional")]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub phone: Option<String>,

    // Project inquiries
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_role: Option<String>,
    #[serde(default)]
    pub project_description: Option<String>,

    // Coaching inquiries
    #[serde(default)]
    pub professional_status: Option<String>,
    #[serde(default)]
    pub coaching_goals: Option<String>,
}

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Response from the external score verification service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreResponse {
    #[serde(default)]
    pub success: bool,
    /// Bot-likelihood score in [0.0, 1.0], higher is more human
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(rename = "error-codes", default)]
    pub error_codes: Vec<String>,
}

/// Result of one contact submission
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    /// Delivered; `remaining` is unknown if the store could not be read
    Accepted { remaining: Option<u32> },

    /// Quota used up; `retry_at` is when the window resets
    RateLimited { retry_at: Option<DateTime<Utc>> },

    /// Bot check failed
    CaptchaFailed { challenge: Option<IssuedChallenge> },

    /// Form fields rejected
    ValidationFailed {
        errors: Vec<FieldError>,
        challenge: Option<IssuedChallenge>,
    },

    /// Email could not be sent; no quota consumed
    DeliveryFailed { challenge: Option<IssuedChallenge> },
}

impl SubmissionOutcome {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::RateLimited { .. } => "rate_limited",
            Self::CaptchaFailed { .. } => "captcha_failed",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::DeliveryFailed { .. } => "delivery_failed",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}
