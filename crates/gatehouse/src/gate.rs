//! Contact submission pipeline.
//!
//! Every submission goes through the same fixed sequence:
//! rate check, bot check, field validation, delivery, then quota recording.
//! Quota is only consumed once both emails went out.

use chrono::{DateTime, Utc};
use humble_common::{ContactForm, IssuedChallenge, SubmissionOutcome};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::captcha::CaptchaVerifier;
use crate::clock::Clock;
use crate::mail::ContactMailer;
use crate::ratelimit::RateLimitStore;
use crate::validation::FormValidator;

/// Proof of humanity attached to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaProof {
    /// Token from the external score service
    External { token: String },
    /// Answer to a previously issued math challenge
    Math { challenge_id: String, answer: String },
    None,
}

/// Raw captcha fields as they arrive with the form
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptchaFields {
    #[serde(default)]
    pub captcha_token: Option<String>,
    #[serde(default)]
    pub math_challenge_id: Option<String>,
    #[serde(default, deserialize_with = "answer_text")]
    pub math_answer: Option<String>,
}

/// Pages send the answer either as typed text or as a JSON number
#[derive(Deserialize)]
#[serde(untagged)]
enum AnswerField {
    Integer(i64),
    Float(f64),
    Text(String),
}

fn answer_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<AnswerField>::deserialize(deserializer)?.map(|answer| match answer {
        AnswerField::Integer(n) => n.to_string(),
        // 7.0 is still 7; 7.5 stays unparseable and fails the check
        AnswerField::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => (f as i64).to_string(),
        AnswerField::Float(f) => f.to_string(),
        AnswerField::Text(s) => s,
    }))
}

impl CaptchaProof {
    /// External token wins; otherwise both math fields must be present
    pub fn from_fields(fields: CaptchaFields) -> Self {
        fn present(v: Option<String>) -> Option<String> {
            v.filter(|s| !s.trim().is_empty())
        }

        if let Some(token) = present(fields.captcha_token) {
            return Self::External { token };
        }

        match (present(fields.math_challenge_id), present(fields.math_answer)) {
            (Some(challenge_id), Some(answer)) => Self::Math {
                challenge_id,
                answer,
            },
            _ => Self::None,
        }
    }
}

/// Orchestrates rate limiting, bot checks, validation, and delivery
pub struct ContactGate {
    store: Arc<dyn RateLimitStore>,
    captcha: Arc<CaptchaVerifier>,
    validator: Arc<dyn FormValidator>,
    mailer: Arc<ContactMailer>,
    clock: Arc<dyn Clock>,
    delivery_timeout: Duration,
}

impl ContactGate {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        captcha: Arc<CaptchaVerifier>,
        validator: Arc<dyn FormValidator>,
        mailer: Arc<ContactMailer>,
        clock: Arc<dyn Clock>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            store,
            captcha,
            validator,
            mailer,
            clock,
            delivery_timeout,
        }
    }

    /// Run one contact submission through the pipeline
    pub async fn submit(
        &self,
        client_ip: &str,
        session_id: &str,
        form: &ContactForm,
        proof: CaptchaProof,
    ) -> SubmissionOutcome {
        // 1. Rate check, failing open if the store is down
        match self.store.is_limited(client_ip).await {
            Ok(true) => {
                let retry_at = self.reset_time(client_ip).await;
                info!(client_ip = %client_ip, outcome = "rate_limited", "Contact submission rejected");
                return SubmissionOutcome::RateLimited { retry_at };
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    client_ip = %client_ip,
                    error = %e,
                    "Rate limit check unavailable, processing submission anyway"
                );
            }
        }

        // 2. Bot check
        let human = match &proof {
            CaptchaProof::External { token } => self.captcha.verify_token(token, client_ip).await,
            CaptchaProof::Math {
                challenge_id,
                answer,
            } => {
                self.captcha
                    .verify_challenge(session_id, challenge_id, answer)
                    .await
            }
            CaptchaProof::None => false,
        };

        if !human {
            info!(client_ip = %client_ip, outcome = "captcha_failed", "Contact submission rejected");
            return SubmissionOutcome::CaptchaFailed {
                challenge: self.fresh_challenge(session_id).await,
            };
        }

        // 3. Field validation
        let errors = self.validator.validate(form);
        if !errors.is_empty() {
            info!(
                client_ip = %client_ip,
                outcome = "validation_failed",
                error_count = errors.len(),
                "Contact submission rejected"
            );
            return SubmissionOutcome::ValidationFailed {
                errors,
                challenge: self.fresh_challenge(session_id).await,
            };
        }

        // 4. Delivery
        let delivery = tokio::time::timeout(self.delivery_timeout, async {
            self.mailer
                .send_business_notification(form, client_ip, self.clock.now())
                .await?;
            self.mailer.send_user_confirmation(form).await
        })
        .await;

        match delivery {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(client_ip = %client_ip, outcome = "delivery_failed", error = %e, "Contact delivery failed");
                return SubmissionOutcome::DeliveryFailed {
                    challenge: self.fresh_challenge(session_id).await,
                };
            }
            Err(_) => {
                error!(client_ip = %client_ip, outcome = "delivery_failed", "Contact delivery timed out");
                return SubmissionOutcome::DeliveryFailed {
                    challenge: self.fresh_challenge(session_id).await,
                };
            }
        }

        // 5. Record, never downgrading a delivered submission
        let remaining = match self.store.record_submission(client_ip).await {
            Ok(record) => Some(
                self.store
                    .policy()
                    .remaining(Some(&record), self.clock.now()),
            ),
            Err(e) => {
                error!(client_ip = %client_ip, error = %e, "Error updating rate limit");
                None
            }
        };

        info!(client_ip = %client_ip, outcome = "accepted", ?remaining, "Contact submission accepted");
        SubmissionOutcome::Accepted { remaining }
    }

    /// Issue a math challenge for the contact page
    pub async fn issue_challenge(&self, session_id: &str) -> Option<IssuedChallenge> {
        self.fresh_challenge(session_id).await
    }

    pub fn is_recaptcha_configured(&self) -> bool {
        self.captcha.is_recaptcha_configured()
    }

    /// Whether `client_ip` is currently blocked. False when the store is down.
    pub async fn is_rate_limited(&self, client_ip: &str) -> bool {
        match self.store.is_limited(client_ip).await {
            Ok(limited) => limited,
            Err(e) => {
                warn!(client_ip = %client_ip, error = %e, "Error checking rate limit");
                false
            }
        }
    }

    /// Submissions left in the current window, the full quota if unknown
    pub async fn remaining_submissions(&self, client_ip: &str) -> u32 {
        let policy = self.store.policy();
        match self.store.find(client_ip).await {
            Ok(record) => policy.remaining(record.as_ref(), self.clock.now()),
            Err(e) => {
                warn!(client_ip = %client_ip, error = %e, "Error getting remaining submissions");
                policy.max_submissions
            }
        }
    }

    /// When the current window ends, if there is a live one
    pub async fn reset_time(&self, client_ip: &str) -> Option<DateTime<Utc>> {
        let window = self.store.policy().window;
        match self.store.find(client_ip).await {
            Ok(Some(record)) if !record.is_expired(self.clock.now(), window) => {
                Some(record.window_end(window))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(client_ip = %client_ip, error = %e, "Error getting reset time");
                None
            }
        }
    }

    async fn fresh_challenge(&self, session_id: &str) -> Option<IssuedChallenge> {
        match self.captcha.issue_challenge(session_id).await {
            Ok(challenge) => Some(challenge),
            Err(e) => {
                error!(error = %e, "Could not issue math challenge");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::captcha::CaptchaPolicy;
    use crate::captcha::verifier::tests::FakeScoreService;
    use crate::clock::ManualClock;
    use crate::mail::tests::{RecordingMailer, sample_form};
    use crate::ratelimit::MemoryRateLimitStore;
    use crate::session::MemorySessionStore;
    use crate::validation::ContactFormValidator;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use humble_common::{GateError, RateLimitPolicy, RateLimitRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const IP: &str = "1.2.3.4";
    const SESSION: &str = "visitor";

    /// Wraps the memory store, counting writes and optionally failing
    pub(crate) struct ScriptedStore {
        inner: MemoryRateLimitStore,
        fail_reads: bool,
        fail_writes: bool,
        records: AtomicUsize,
    }

    #[async_trait]
    impl RateLimitStore for ScriptedStore {
        fn policy(&self) -> RateLimitPolicy {
            self.inner.policy()
        }

        async fn find(&self, ip: &str) -> Result<Option<RateLimitRecord>, GateError> {
            if self.fail_reads {
                return Err(GateError::StoreUnavailable("connection refused".to_string()));
            }
            self.inner.find(ip).await
        }

        async fn is_limited(&self, ip: &str) -> Result<bool, GateError> {
            if self.fail_reads {
                return Err(GateError::StoreUnavailable("connection refused".to_string()));
            }
            self.inner.is_limited(ip).await
        }

        async fn record_submission(&self, ip: &str) -> Result<RateLimitRecord, GateError> {
            self.records.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Err(GateError::StoreUnavailable("connection refused".to_string()));
            }
            self.inner.record_submission(ip).await
        }

        async fn sweep_expired(&self) -> Result<u64, GateError> {
            self.inner.sweep_expired().await
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<ScriptedStore>,
        mailer: Arc<RecordingMailer>,
        gate: ContactGate,
    }

    struct Options {
        score: FakeScoreService,
        fail_reads: bool,
        fail_writes: bool,
        fail_mail_to: Option<String>,
    }

    impl Default for Options {
        fn default() -> Self {
            Self {
                score: FakeScoreService::scoring(0.9),
                fail_reads: false,
                fail_writes: false,
                fail_mail_to: None,
            }
        }
    }

    fn harness(opts: Options) -> Harness {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(ScriptedStore {
            inner: MemoryRateLimitStore::new(RateLimitPolicy::default(), clock.clone()),
            fail_reads: opts.fail_reads,
            fail_writes: opts.fail_writes,
            records: AtomicUsize::new(0),
        });
        let mailer = Arc::new(RecordingMailer {
            fail_to: opts.fail_mail_to,
            ..Default::default()
        });
        let captcha = Arc::new(CaptchaVerifier::new(
            Arc::new(opts.score),
            Arc::new(MemorySessionStore::new(1800)),
            clock.clone(),
            CaptchaPolicy::default(),
        ));
        let gate = ContactGate::new(
            store.clone(),
            captcha,
            Arc::new(ContactFormValidator),
            Arc::new(ContactMailer::new(mailer.clone(), "owner@humble.test".to_string())),
            clock.clone(),
            Duration::from_secs(10),
        );

        Harness {
            clock,
            store,
            mailer,
            gate,
        }
    }

    fn token() -> CaptchaProof {
        CaptchaProof::External {
            token: "token".to_string(),
        }
    }

    #[test]
    fn test_proof_selection() {
        let fields = CaptchaFields {
            captcha_token: Some("tok".to_string()),
            math_challenge_id: Some("abc".to_string()),
            math_answer: Some("7".to_string()),
        };
        assert_eq!(
            CaptchaProof::from_fields(fields),
            CaptchaProof::External {
                token: "tok".to_string()
            }
        );

        let fields = CaptchaFields {
            captcha_token: Some("".to_string()),
            math_challenge_id: Some("abc".to_string()),
            math_answer: Some("7".to_string()),
        };
        assert_eq!(
            CaptchaProof::from_fields(fields),
            CaptchaProof::Math {
                challenge_id: "abc".to_string(),
                answer: "7".to_string()
            }
        );

        let fields = CaptchaFields {
            math_challenge_id: Some("abc".to_string()),
            ..Default::default()
        };
        assert_eq!(CaptchaProof::from_fields(fields), CaptchaProof::None);
    }

    #[test]
    fn test_numeric_math_answer_is_accepted() {
        let fields: CaptchaFields =
            serde_json::from_str(r#"{"math_challenge_id": "abc", "math_answer": 7}"#).unwrap();
        assert_eq!(fields.math_answer.as_deref(), Some("7"));

        let fields: CaptchaFields =
            serde_json::from_str(r#"{"math_challenge_id": "abc", "math_answer": " 7 "}"#).unwrap();
        assert_eq!(fields.math_answer.as_deref(), Some(" 7 "));

        let fields: CaptchaFields = serde_json::from_str(r#"{"math_answer": 7.0}"#).unwrap();
        assert_eq!(fields.math_answer.as_deref(), Some("7"));

        let fields: CaptchaFields = serde_json::from_str(r#"{"math_answer": null}"#).unwrap();
        assert_eq!(fields.math_answer, None);
    }

    #[tokio::test]
    async fn test_five_accepted_then_limited() {
        let h = harness(Options::default());
        let form = sample_form();

        for expected_remaining in (0..5u32).rev() {
            let outcome = h.gate.submit(IP, SESSION, &form, token()).await;
            match outcome {
                SubmissionOutcome::Accepted { remaining } => {
                    assert_eq!(remaining, Some(expected_remaining))
                }
                other => panic!("expected accepted, got {other:?}"),
            }
            h.clock.advance(ChronoDuration::minutes(5));
        }

        let outcome = h.gate.submit(IP, SESSION, &form, token()).await;
        match outcome {
            SubmissionOutcome::RateLimited { retry_at } => {
                let first = h.clock.now() - ChronoDuration::minutes(25);
                assert_eq!(retry_at, Some(first + ChronoDuration::hours(1)));
            }
            other => panic!("expected rate limited, got {other:?}"),
        }

        // Rejected submissions neither send mail nor count
        assert_eq!(h.mailer.sent.lock().await.len(), 10);
        assert_eq!(h.store.records.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_fresh_window_after_an_hour() {
        let h = harness(Options::default());
        let form = sample_form();

        for _ in 0..5 {
            assert!(h.gate.submit(IP, SESSION, &form, token()).await.is_accepted());
        }
        assert!(h.gate.is_rate_limited(IP).await);

        h.clock.advance(ChronoDuration::minutes(61));
        let outcome = h.gate.submit(IP, SESSION, &form, token()).await;
        assert!(outcome.is_accepted());
        assert_eq!(h.gate.remaining_submissions(IP).await, 4);
    }

    #[tokio::test]
    async fn test_low_score_fails_captcha_with_fresh_challenge() {
        let h = harness(Options {
            score: FakeScoreService::scoring(0.3),
            ..Default::default()
        });

        let outcome = h.gate.submit(IP, SESSION, &sample_form(), token()).await;
        match outcome {
            SubmissionOutcome::CaptchaFailed { challenge } => assert!(challenge.is_some()),
            other => panic!("expected captcha failure, got {other:?}"),
        }
        assert!(h.mailer.sent.lock().await.is_empty());
        assert_eq!(h.store.records.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_proof_fails_captcha() {
        let h = harness(Options::default());
        let outcome = h
            .gate
            .submit(IP, SESSION, &sample_form(), CaptchaProof::None)
            .await;
        assert_eq!(outcome.kind(), "captcha_failed");
    }

    #[tokio::test]
    async fn test_math_fallback_accepted() {
        let h = harness(Options {
            score: FakeScoreService::unconfigured(),
            ..Default::default()
        });

        let challenge = h.gate.issue_challenge(SESSION).await.unwrap();
        let proof = CaptchaProof::Math {
            challenge_id: challenge.challenge_id.clone(),
            answer: challenge.answer.to_string(),
        };
        assert!(h.gate.submit(IP, SESSION, &sample_form(), proof.clone()).await.is_accepted());

        // Replaying the same challenge does not work
        assert_eq!(
            h.gate.submit(IP, SESSION, &sample_form(), proof).await.kind(),
            "captcha_failed"
        );
    }

    #[tokio::test]
    async fn test_validation_runs_after_captcha() {
        let h = harness(Options::default());
        let mut form = sample_form();
        form.message = "short".to_string();

        // Unverified callers learn nothing about the fields
        let outcome = h.gate.submit(IP, SESSION, &form, CaptchaProof::None).await;
        assert_eq!(outcome.kind(), "captcha_failed");

        let outcome = h.gate.submit(IP, SESSION, &form, token()).await;
        match outcome {
            SubmissionOutcome::ValidationFailed { errors, challenge } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].field, "message");
                assert!(challenge.is_some());
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(h.store.records.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delivery_failure_consumes_no_quota() {
        let h = harness(Options {
            fail_mail_to: Some("owner@humble.test".to_string()),
            ..Default::default()
        });
        let form = sample_form();

        h.store.inner.record_submission(IP).await.unwrap();
        let before = h.store.find(IP).await.unwrap().unwrap().submission_count;

        let outcome = h.gate.submit(IP, SESSION, &form, token()).await;
        match outcome {
            SubmissionOutcome::DeliveryFailed { challenge } => assert!(challenge.is_some()),
            other => panic!("expected delivery failure, got {other:?}"),
        }

        // Only the seeding call went through the store's write path
        assert_eq!(h.store.records.load(Ordering::SeqCst), 0);
        let after = h.store.find(IP).await.unwrap().unwrap().submission_count;
        assert_eq!(before, after);
        assert!(!h.gate.is_rate_limited(IP).await);
    }

    #[tokio::test]
    async fn test_confirmation_failure_is_delivery_failure() {
        let h = harness(Options {
            fail_mail_to: Some("ada@example.com".to_string()),
            ..Default::default()
        });

        let outcome = h.gate.submit(IP, SESSION, &sample_form(), token()).await;
        assert_eq!(outcome.kind(), "delivery_failed");
        assert_eq!(h.store.records.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_down_fails_open() {
        let h = harness(Options {
            fail_reads: true,
            fail_writes: true,
            ..Default::default()
        });

        let outcome = h.gate.submit(IP, SESSION, &sample_form(), token()).await;
        match outcome {
            SubmissionOutcome::Accepted { remaining } => assert_eq!(remaining, None),
            other => panic!("expected accepted, got {other:?}"),
        }

        // The write was still attempted
        assert_eq!(h.store.records.load(Ordering::SeqCst), 1);
        assert!(!h.gate.is_rate_limited(IP).await);
        assert_eq!(h.gate.remaining_submissions(IP).await, 5);
        assert_eq!(h.gate.reset_time(IP).await, None);
    }

    #[tokio::test]
    async fn test_introspection() {
        let h = harness(Options::default());
        assert_eq!(h.gate.remaining_submissions(IP).await, 5);
        assert_eq!(h.gate.reset_time(IP).await, None);

        let start = h.clock.now();
        h.gate.submit(IP, SESSION, &sample_form(), token()).await;
        h.gate.submit(IP, SESSION, &sample_form(), token()).await;

        assert_eq!(h.gate.remaining_submissions(IP).await, 3);
        assert_eq!(
            h.gate.reset_time(IP).await,
            Some(start + ChronoDuration::hours(1))
        );
        assert!(!h.gate.is_rate_limited(IP).await);
    }
}
