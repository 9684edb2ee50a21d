//! Client for the external score verification service (reCAPTCHA v3 style).

use async_trait::async_trait;
use humble_common::constants::PLACEHOLDER_CAPTCHA_SECRET;
use humble_common::{GateError, ScoreResponse};
use std::time::Duration;

/// Third-party bot-likelihood scoring
#[async_trait]
pub trait ScoreService: Send + Sync {
    /// False when the service cannot be used (e.g. no secret)
    fn is_configured(&self) -> bool;

    async fn verify(&self, token: &str, remote_ip: &str) -> Result<ScoreResponse, GateError>;
}

/// HTTP client for a siteverify-compatible endpoint
pub struct RecaptchaClient {
    http: reqwest::Client,
    secret: String,
    verify_url: String,
}

impl RecaptchaClient {
    pub fn new(secret: String, verify_url: String, timeout: Duration) -> Result<Self, GateError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            secret,
            verify_url,
        })
    }
}

#[async_trait]
impl ScoreService for RecaptchaClient {
    fn is_configured(&self) -> bool {
        !self.secret.is_empty() && self.secret != PLACEHOLDER_CAPTCHA_SECRET
    }

    async fn verify(&self, token: &str, remote_ip: &str) -> Result<ScoreResponse, GateError> {
        let response = self
            .http
            .post(&self.verify_url)
            .form(&[
                ("secret", self.secret.as_str()),
                ("response", token),
                ("remoteip", remote_ip),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GateError::CaptchaService(e.to_string()))?;

        response
            .json::<ScoreResponse>()
            .await
            .map_err(|e| GateError::CaptchaService(format!("bad response body: {e}")))
    }
}
