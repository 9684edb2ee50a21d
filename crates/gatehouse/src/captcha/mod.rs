//! Bot verification for contact submissions.
//!
//! Two strategies: an external score service (preferred when the page could
//! obtain a token) and a server-held math challenge as the fallback.

mod generator;
mod score;
pub(crate) mod verifier;

pub use generator::{MathChallenge, generate_challenge_id};
pub use score::{RecaptchaClient, ScoreService};
pub use verifier::{CaptchaPolicy, CaptchaVerifier};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Math challenge as kept in the visitor's session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChallenge {
    /// The expected answer
    pub answer: i64,
    /// Creation timestamp (Unix epoch seconds)
    pub created_at: i64,
}

/// Outstanding challenges for one visitor, keyed by challenge ID
pub type ChallengeMap = HashMap<String, StoredChallenge>;
