//! Contact form endpoints.

use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use humble_common::constants::headers::{SESSION_COOKIE, X_FORWARDED_FOR};
use humble_common::{ContactForm, SubmissionOutcome};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::gate::{CaptchaFields, CaptchaProof};
use crate::session::generate_session_id;
use crate::state::AppState;

/// Client address used as the rate limit key
pub struct ClientIp(pub String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self(client_ip(
            &parts.headers,
            peer,
            state.config.trust_forwarded_for,
        )))
    }
}

/// First X-Forwarded-For hop when trusted, else the socket peer
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let forwarded = headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Visitor session from the cookie, or a freshly minted one
pub struct VisitorSession {
    pub id: String,
    set_cookie: Option<HeaderValue>,
}

impl FromRequestParts<AppState> for VisitorSession {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(id) = session_cookie(&parts.headers) {
            return Ok(Self {
                id,
                set_cookie: None,
            });
        }

        let id = generate_session_id();
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE, id, state.config.session.ttl_secs
        );
        if state.config.session.secure_cookie {
            cookie.push_str("; Secure");
        }

        Ok(Self {
            id,
            // Always valid: the ID is URL-safe base64
            set_cookie: HeaderValue::from_str(&cookie).ok(),
        })
    }
}

impl VisitorSession {
    /// Attach Set-Cookie when the session was created by this request
    fn attach(&self, mut response: Response) -> Response {
        if let Some(ref cookie) = self.set_cookie {
            response
                .headers_mut()
                .append(header::SET_COOKIE, cookie.clone());
        }
        response
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| {
            !value.is_empty()
                && value.len() <= 128
                && value
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

#[derive(Serialize)]
pub struct ChallengeResponse {
    challenge_id: String,
    question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    recaptcha_site_key: Option<String>,
}

/// Issue a math challenge for the contact page
pub async fn get_challenge(State(state): State<AppState>, session: VisitorSession) -> Response {
    let response = match state.gate.issue_challenge(&session.id).await {
        Some(challenge) => {
            let recaptcha_site_key = (state.gate.is_recaptcha_configured()
                && !state.config.captcha.site_key.is_empty())
            .then(|| state.config.captcha.site_key.clone());

            Json(ChallengeResponse {
                challenge_id: challenge.challenge_id,
                question: challenge.question,
                recaptcha_site_key,
            })
            .into_response()
        }
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    };

    session.attach(response)
}

/// Form fields plus whichever bot check the page performed
#[derive(Deserialize)]
pub struct ContactSubmission {
    #[serde(flatten)]
    form: ContactForm,
    #[serde(flatten)]
    captcha: CaptchaFields,
}

/// Run a contact submission through the gate
pub async fn submit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    session: VisitorSession,
    payload: Result<Json<ContactSubmission>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::info!(
                client_ip = %ip,
                error = %rejection.body_text(),
                "Unreadable contact submission"
            );
            return session.attach(rejection_response(&rejection));
        }
    };

    let proof = CaptchaProof::from_fields(payload.captcha);
    let outcome = state
        .gate
        .submit(&ip, &session.id, &payload.form, proof)
        .await;

    session.attach(outcome_response(&state, outcome))
}

/// Malformed bodies get a generic message; parser detail stays in the log
fn rejection_response(rejection: &JsonRejection) -> Response {
    let status = match rejection {
        JsonRejection::JsonDataError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_REQUEST,
    };

    (
        status,
        Json(serde_json::json!({
            "outcome": "invalid_request",
            "message": "The form could not be read. Please check your input and try again.",
        })),
    )
        .into_response()
}

fn outcome_response(state: &AppState, outcome: SubmissionOutcome) -> Response {
    let (status, message) = match &outcome {
        SubmissionOutcome::Accepted { .. } => (
            StatusCode::CREATED,
            "Thank you for your message! We will get back to you soon.".to_string(),
        ),
        SubmissionOutcome::RateLimited { .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "You have exceeded the submission limit of {} messages. Please try again later.",
                state.store.policy().max_submissions
            ),
        ),
        SubmissionOutcome::CaptchaFailed { .. } => (
            StatusCode::BAD_REQUEST,
            "Please complete the security verification.".to_string(),
        ),
        SubmissionOutcome::ValidationFailed { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Please correct the errors below.".to_string(),
        ),
        SubmissionOutcome::DeliveryFailed { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "There was an error sending your message. Please try again.".to_string(),
        ),
    };

    let mut body = match serde_json::to_value(&outcome) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize submission outcome");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    if let Some(map) = body.as_object_mut() {
        map.insert("message".to_string(), message.into());
    }

    let mut response = (status, Json(body)).into_response();

    if let SubmissionOutcome::RateLimited {
        retry_at: Some(retry_at),
    } = outcome
    {
        let secs = (retry_at - state.clock.now()).num_seconds().max(1);
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }

    response
}

#[derive(Serialize)]
pub struct StatusResponse {
    rate_limited: bool,
    remaining: u32,
    reset_at: Option<DateTime<Utc>>,
}

/// Rate limit standing of the calling client
pub async fn get_status(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        rate_limited: state.gate.is_rate_limited(&ip).await,
        remaining: state.gate.remaining_submissions(&ip).await,
        reset_at: state.gate.reset_time(&ip).await,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::verifier::tests::FakeScoreService;
    use crate::clock::ManualClock;
    use crate::config::AppConfig;
    use crate::mail::tests::RecordingMailer;
    use crate::ratelimit::MemoryRateLimitStore;
    use crate::routes::create_router;
    use crate::session::MemorySessionStore;
    use crate::state::Components;
    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use humble_common::RateLimitPolicy;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(score: FakeScoreService) -> Router {
        let clock = Arc::new(ManualClock::at_epoch());
        let mut config = AppConfig::default();
        config.trust_forwarded_for = true;
        config.captcha.site_key = "site-key".to_string();

        let state = AppState::from_components(
            config,
            Components {
                store: Arc::new(MemoryRateLimitStore::new(
                    RateLimitPolicy::default(),
                    clock.clone(),
                )),
                sessions: Arc::new(MemorySessionStore::new(1800)),
                score: Arc::new(score),
                transport: Arc::new(RecordingMailer::default()),
                clock,
            },
        );
        create_router(state)
    }

    fn valid_body(extra: Value) -> Value {
        let mut body = json!({
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            "message": "I would like to discuss a project with you.",
        });
        if let (Some(map), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            map.extend(extra.clone());
        }
        body
    }

    fn post(ip: &str, cookie: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::post("/contact")
            .header(header::CONTENT_TYPE, "application/json")
            .header(X_FORWARDED_FOR, format!("{ip}, 10.0.0.1"));
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// "What is 7 - 3?" -> 4
    fn solve(question: &str) -> i64 {
        let parts: Vec<&str> = question
            .trim_start_matches("What is ")
            .trim_end_matches('?')
            .split_whitespace()
            .collect();
        let a: i64 = parts[0].parse().unwrap();
        let b: i64 = parts[2].parse().unwrap();
        match parts[1] {
            "+" => a + b,
            "-" => a - b,
            "*" | "×" => a * b,
            op => panic!("unexpected operator {op}"),
        }
    }

    #[test]
    fn test_client_ip_resolution() {
        let peer: SocketAddr = "203.0.113.9:51000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.7, 10.0.0.1"));

        assert_eq!(client_ip(&headers, Some(peer), true), "198.51.100.7");
        assert_eq!(client_ip(&headers, Some(peer), false), "203.0.113.9");
        assert_eq!(client_ip(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn test_session_cookie_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; gatehouse_sid=abc_DEF-123"),
        );
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc_DEF-123"));

        headers.insert(header::COOKIE, HeaderValue::from_static("gatehouse_sid=bad;value"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("bad"));

        headers.insert(header::COOKIE, HeaderValue::from_static("gatehouse_sid=<x>"));
        assert_eq!(session_cookie(&headers), None);
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(FakeScoreService::scoring(0.9))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_with_memory_store() {
        let response = app(FakeScoreService::scoring(0.9))
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_challenge_sets_session_cookie() {
        let response = app(FakeScoreService::scoring(0.9))
            .oneshot(Request::get("/contact/challenge").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("gatehouse_sid="));
        assert!(cookie.contains("HttpOnly"));

        let body = json_body(response).await;
        assert!(body["question"].as_str().unwrap().starts_with("What is "));
        assert_eq!(body["recaptcha_site_key"], "site-key");
        assert!(body.get("answer").is_none());
    }

    #[tokio::test]
    async fn test_math_challenge_round_trip() {
        let app = app(FakeScoreService::unconfigured());

        let response = app
            .clone()
            .oneshot(Request::get("/contact/challenge").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let cookie = set_cookie.split(';').next().unwrap().to_string();
        let challenge = json_body(response).await;
        assert!(challenge.get("recaptcha_site_key").is_none());

        let proof = json!({
            "math_challenge_id": challenge["challenge_id"],
            "math_answer": solve(challenge["question"].as_str().unwrap()).to_string(),
        });
        let response = app
            .clone()
            .oneshot(post("198.51.100.7", Some(&cookie), valid_body(proof.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "accepted");
        assert_eq!(body["remaining"], 4);

        // Single use
        let response = app
            .oneshot(post("198.51.100.7", Some(&cookie), valid_body(proof)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "captcha_failed");
        assert!(body["challenge"]["challenge_id"].is_string());
    }

    #[tokio::test]
    async fn test_sixth_submission_is_rate_limited() {
        let app = app(FakeScoreService::scoring(0.9));
        let token = json!({ "captcha_token": "tok" });

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(post("198.51.100.7", None, valid_body(token.clone())))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .clone()
            .oneshot(post("198.51.100.7", None, valid_body(token.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3600");
        assert_eq!(json_body(response).await["outcome"], "rate_limited");

        // Other clients are unaffected
        let response = app
            .clone()
            .oneshot(post("198.51.100.8", None, valid_body(token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(
                Request::get("/contact/status")
                    .header(X_FORWARDED_FOR, "198.51.100.7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = json_body(response).await;
        assert_eq!(status["rate_limited"], true);
        assert_eq!(status["remaining"], 0);
        assert_eq!(status["reset_at"], "2025-09-26T13:00:00Z");
    }

    #[tokio::test]
    async fn test_validation_errors_are_reported() {
        let response = app(FakeScoreService::scoring(0.9))
            .oneshot(post(
                "198.51.100.7",
                None,
                json!({ "name": "Ada", "email": "not-an-email", "captcha_token": "tok" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "validation_failed");
        let fields: Vec<&str> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, vec!["email", "message"]);
    }

    #[tokio::test]
    async fn test_blank_service_type_is_general_inquiry() {
        let response = app(FakeScoreService::scoring(0.9))
            .oneshot(post(
                "198.51.100.7",
                None,
                valid_body(json!({ "service_type": "", "captcha_token": "tok" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["outcome"], "accepted");
    }

    #[tokio::test]
    async fn test_numeric_math_answer() {
        let app = app(FakeScoreService::unconfigured());

        let response = app
            .clone()
            .oneshot(Request::get("/contact/challenge").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        let cookie = set_cookie.split(';').next().unwrap().to_string();
        let challenge = json_body(response).await;

        let proof = json!({
            "math_challenge_id": challenge["challenge_id"],
            "math_answer": solve(challenge["question"].as_str().unwrap()),
        });
        let response = app
            .oneshot(post("198.51.100.7", Some(&cookie), valid_body(proof)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_unreadable_body_gets_structured_error() {
        let app = app(FakeScoreService::scoring(0.9));

        let response = app
            .clone()
            .oneshot(post(
                "198.51.100.7",
                None,
                valid_body(json!({ "service_type": "astrology", "captcha_token": "tok" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["outcome"], "invalid_request");
        assert!(!body.to_string().contains("variant"));

        let request = Request::post("/contact")
            .header(header::CONTENT_TYPE, "application/json")
            .header(X_FORWARDED_FOR, "198.51.100.7")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["outcome"], "invalid_request");
    }

    #[tokio::test]
    async fn test_fresh_client_status() {
        let response = app(FakeScoreService::scoring(0.9))
            .oneshot(
                Request::get("/contact/status")
                    .header(X_FORWARDED_FOR, "192.0.2.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = json_body(response).await;
        assert_eq!(status["rate_limited"], false);
        assert_eq!(status["remaining"], 5);
        assert!(status["reset_at"].is_null());
    }
}
