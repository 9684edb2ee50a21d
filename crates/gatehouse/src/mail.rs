//! Contact email delivery.
//!
//! [`Mailer`] is the raw send capability; [`ContactMailer`] composes the two
//! messages a submission produces on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use humble_common::{ContactForm, GateError, ServiceType};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const BUSINESS_SUBJECT: &str = "New Contact Form Submission";
pub const CONFIRMATION_SUBJECT: &str = "Your message has been received";

/// Plain-text email sending
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GateError>;
}

/// Writes messages to the log instead of sending them
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GateError> {
        info!(to = %to, subject = %subject, body_len = body.len(), "Mail (log only)");
        Ok(())
    }
}

/// Hands messages to an HTTP mail relay as JSON
pub struct WebhookMailer {
    http: reqwest::Client,
    endpoint: String,
    from: String,
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
}

impl WebhookMailer {
    pub fn new(endpoint: String, from: String, timeout: Duration) -> Result<Self, GateError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GateError::Config(format!("http client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            from,
        })
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GateError> {
        let message = RelayMessage {
            from: &self.from,
            to,
            subject,
            text: body,
        };

        self.http
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GateError::Delivery(e.to_string()))?;

        Ok(())
    }
}

/// Composes and sends the messages for a contact submission
pub struct ContactMailer {
    mailer: Arc<dyn Mailer>,
    business_email: String,
}

impl ContactMailer {
    pub fn new(mailer: Arc<dyn Mailer>, business_email: String) -> Self {
        Self {
            mailer,
            business_email,
        }
    }

    /// Notify the site owner about a submission
    pub async fn send_business_notification(
        &self,
        form: &ContactForm,
        client_ip: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), GateError> {
        let body = render_business_notification(form, client_ip, submitted_at);

        match self.mailer.send(&self.business_email, BUSINESS_SUBJECT, &body).await {
            Ok(()) => {
                info!(client_ip = %client_ip, "Business notification email sent");
                Ok(())
            }
            Err(e) => {
                error!(client_ip = %client_ip, error = %e, "Failed to send business notification email");
                Err(e)
            }
        }
    }

    /// Tell the visitor we got their message
    pub async fn send_user_confirmation(&self, form: &ContactForm) -> Result<(), GateError> {
        if form.email.trim().is_empty() {
            return Ok(());
        }

        let body = render_user_confirmation(form);

        match self.mailer.send(&form.email, CONFIRMATION_SUBJECT, &body).await {
            Ok(()) => {
                info!(to = %form.email, "User confirmation email sent");
                Ok(())
            }
            Err(e) => {
                error!(to = %form.email, error = %e, "Failed to send user confirmation email");
                Err(e)
            }
        }
    }

    /// Send an arbitrary test message through the configured mailer
    pub async fn send_test(&self, to: &str) -> Result<(), GateError> {
        self.mailer
            .send(to, "Mail test from gatehouse", "Hello from a humble wizard!")
            .await
    }
}

fn or_not_provided(value: &Option<String>) -> &str {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => "Not provided",
    }
}

fn render_business_notification(
    form: &ContactForm,
    client_ip: &str,
    submitted_at: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str("New Contact Form Submission\n");
    out.push_str(&"=".repeat(30));
    out.push_str("\n\n");

    out.push_str("Contact Information:\n");
    out.push_str(&format!("- Name: {}\n", form.name));
    out.push_str(&format!("- Email: {}\n", form.email));
    out.push_str(&format!("- Phone: {}\n\n", or_not_provided(&form.phone)));

    out.push_str("Message:\n");
    out.push_str(&form.message);
    out.push_str("\n\n");

    if let Some(service) = form.service_type {
        out.push_str(&format!("Service Interest: {}\n\n", service.label()));
        match service {
            ServiceType::Coaching => {
                out.push_str("Coaching Information:\n");
                out.push_str(&format!(
                    "- Professional Status: {}\n",
                    or_not_provided(&form.professional_status)
                ));
                out.push_str(&format!(
                    "- Coaching Goals: {}\n",
                    or_not_provided(&form.coaching_goals)
                ));
            }
            ServiceType::Project => {
                out.push_str("Project Information:\n");
                out.push_str(&format!("- Company: {}\n", or_not_provided(&form.company)));
                out.push_str(&format!("- Job Role: {}\n", or_not_provided(&form.job_role)));
                out.push_str(&format!(
                    "- Project Description: {}\n",
                    or_not_provided(&form.project_description)
                ));
            }
        }
        out.push('\n');
    }

    out.push_str("Technical Information:\n");
    out.push_str(&format!("- Submitted from IP: {}\n", client_ip));
    out.push_str(&format!(
        "- Submission time: {}\n",
        submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    out
}

fn render_user_confirmation(form: &ContactForm) -> String {
    let name = match form.name.trim() {
        "" => "there",
        name => name,
    };

    format!(
        "Your message has been received\n\n\
         The scroll has arrived!\n\n\
         Hello {name},\n\n\
         Your message has made its way to the Humble Wizards' tower. \
         We'll review it with care before sending a reply your way.\n\n\
         No need to cast refresh - we'll be back in touch as soon as our reply is ready.\n\n\
         Until then, may your day be a little more magical,\n\
         The Humble Wizards"
    )
}
