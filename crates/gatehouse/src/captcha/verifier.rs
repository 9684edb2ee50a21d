//! CAPTCHA verification logic.
//!
//! Verification never fails loudly: every problem (missing secret, transport
//! error, timeout, unknown challenge) resolves to `false` and is logged.

use humble_common::constants::{MATH_CHALLENGE_TTL_SECS, MIN_CAPTCHA_SCORE, session_keys};
use humble_common::{GateError, IssuedChallenge};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{ChallengeMap, MathChallenge, ScoreService, StoredChallenge, generate_challenge_id};
use crate::clock::Clock;
use crate::session::SessionStore;

/// Thresholds and limits for verification
#[derive(Debug, Clone, Copy)]
pub struct CaptchaPolicy {
    /// Lowest external score treated as human
    pub min_score: f64,
    /// Unused math challenges are dropped after this many seconds
    pub challenge_ttl_secs: u64,
    /// Upper bound on one external verification call
    pub verify_timeout: Duration,
}

impl Default for CaptchaPolicy {
    fn default() -> Self {
        Self {
            min_score: MIN_CAPTCHA_SCORE,
            challenge_ttl_secs: MATH_CHALLENGE_TTL_SECS,
            verify_timeout: Duration::from_secs(5),
        }
    }
}

impl CaptchaPolicy {
    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.challenge_ttl_secs).unwrap_or(i64::MAX)
    }
}

/// CAPTCHA verifier service
pub struct CaptchaVerifier {
    score_service: Arc<dyn ScoreService>,
    sessions: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    policy: CaptchaPolicy,
}

impl CaptchaVerifier {
    pub fn new(
        score_service: Arc<dyn ScoreService>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        policy: CaptchaPolicy,
    ) -> Self {
        Self {
            score_service,
            sessions,
            clock,
            policy,
        }
    }

    /// Whether the external strategy can be offered at all
    pub fn is_recaptcha_configured(&self) -> bool {
        self.score_service.is_configured()
    }

    /// Check an external score token. Accepts iff `success && score >= min_score`.
    pub async fn verify_token(&self, token: &str, client_ip: &str) -> bool {
        if !self.score_service.is_configured() {
            warn!("CAPTCHA secret key not configured, falling back to math challenge");
            return false;
        }

        let result = tokio::time::timeout(
            self.policy.verify_timeout,
            self.score_service.verify(token, client_ip),
        )
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(client_ip = %client_ip, error = %e, "CAPTCHA verification error");
                return false;
            }
            Err(_) => {
                error!(
                    client_ip = %client_ip,
                    timeout_ms = self.policy.verify_timeout.as_millis() as u64,
                    "CAPTCHA verification timed out"
                );
                return false;
            }
        };

        if !response.success {
            warn!(
                client_ip = %client_ip,
                errors = ?response.error_codes,
                "CAPTCHA verification failed"
            );
            return false;
        }

        let score = response.score.unwrap_or(0.0);
        if score >= self.policy.min_score {
            info!(
                client_ip = %client_ip,
                score,
                action = ?response.action,
                "CAPTCHA verification successful"
            );
            true
        } else {
            warn!(
                client_ip = %client_ip,
                score,
                action = ?response.action,
                "CAPTCHA score too low"
            );
            false
        }
    }

    /// Issue a new math challenge into the visitor's session.
    ///
    /// Also purges that visitor's challenges older than the TTL.
    pub async fn issue_challenge(&self, session_id: &str) -> Result<IssuedChallenge, GateError> {
        let challenge = MathChallenge::random(&mut rand::rng());
        let issued = challenge.issue(generate_challenge_id());
        let now = self.clock.now().timestamp();

        let mut challenges = self.load(session_id).await?;
        challenges.insert(
            issued.challenge_id.clone(),
            StoredChallenge {
                answer: issued.answer,
                created_at: now,
            },
        );

        let cutoff = now.saturating_sub(self.policy.ttl_secs());
        challenges.retain(|_, c| c.created_at >= cutoff);

        self.save(session_id, &challenges).await?;

        debug!(
            challenge_id = %issued.challenge_id,
            outstanding = challenges.len(),
            "Generated math challenge"
        );

        Ok(issued)
    }

    /// Check and consume a math challenge. True at most once per ID.
    pub async fn verify_challenge(&self, session_id: &str, challenge_id: &str, answer: &str) -> bool {
        let mut challenges = match self.load(session_id).await {
            Ok(c) => c,
            Err(e) => {
                error!(challenge_id = %challenge_id, error = %e, "Could not load math challenges");
                return false;
            }
        };

        let Some(stored) = challenges.remove(challenge_id) else {
            warn!(challenge_id = %challenge_id, "Math challenge not found or expired");
            return false;
        };

        // Consumption must stick, otherwise the challenge could be replayed
        if let Err(e) = self.save(session_id, &challenges).await {
            error!(challenge_id = %challenge_id, error = %e, "Could not consume math challenge");
            return false;
        }

        let age = self.clock.now().timestamp() - stored.created_at;
        if age > self.policy.ttl_secs() {
            warn!(challenge_id = %challenge_id, age_secs = age, "Math challenge expired");
            return false;
        }

        let correct = answer.trim().parse::<i64>().ok() == Some(stored.answer);

        info!(challenge_id = %challenge_id, correct, "Math challenge verification");

        correct
    }

    async fn load(&self, session_id: &str) -> Result<ChallengeMap, GateError> {
        match self
            .sessions
            .get(session_id, session_keys::MATH_CHALLENGES)
            .await?
        {
            Some(data) => Ok(serde_json::from_str(&data)?),
            None => Ok(ChallengeMap::new()),
        }
    }

    async fn save(&self, session_id: &str, challenges: &ChallengeMap) -> Result<(), GateError> {
        let data = serde_json::to_string(challenges)?;
        self.sessions
            .set(session_id, session_keys::MATH_CHALLENGES, data)
            .await
    }
}
