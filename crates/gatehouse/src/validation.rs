//! Contact form field validation.
//!
//! Text fields are restricted to alphanumerics plus a small per-field set of
//! punctuation; email addresses must be plain ASCII.

use humble_common::{ContactForm, FieldError, ServiceType};
use regex::Regex;
use std::sync::LazyLock;

/// Checks a contact form, returning every field-level problem found
pub trait FormValidator: Send + Sync {
    fn validate(&self, form: &ContactForm) -> Vec<FieldError>;
}

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s.,'-]+$").unwrap());
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap());
static MESSAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s.,'\-!?:;()]+$").unwrap());
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s+\-().]+$").unwrap());
static COMPANY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s.,'\-&]+$").unwrap());
static JOB_ROLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s.,'\-/]+$").unwrap());
static LONG_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\s.,'\-!?:;()/]+$").unwrap());

/// Length bounds in characters
struct Length {
    min: usize,
    max: usize,
}

/// One optional free-text field
struct TextRule<'a> {
    field: &'a str,
    label: &'a str,
    length: Length,
    pattern: &'a Regex,
    required: bool,
}

impl TextRule<'_> {
    fn check(&self, value: Option<&str>, errors: &mut Vec<FieldError>) {
        let value = value.map(str::trim).unwrap_or_default();

        if value.is_empty() {
            if self.required {
                errors.push(FieldError::new(
                    self.field,
                    format!("Please describe your {}", self.label.to_lowercase()),
                ));
            }
            return;
        }

        let len = value.chars().count();
        if len < self.length.min {
            errors.push(FieldError::new(
                self.field,
                format!(
                    "{} must be at least {} characters when provided",
                    self.label, self.length.min
                ),
            ));
        } else if len > self.length.max {
            errors.push(FieldError::new(
                self.field,
                format!("{} cannot be longer than {} characters", self.label, self.length.max),
            ));
        } else if !self.pattern.is_match(value) {
            errors.push(FieldError::new(
                self.field,
                format!("{} contains invalid characters", self.label),
            ));
        }
    }
}

/// The site's contact form rules
#[derive(Debug, Default, Clone, Copy)]
pub struct ContactFormValidator;

impl ContactFormValidator {
    fn check_name(name: &str, errors: &mut Vec<FieldError>) {
        let name = name.trim();
        if name.is_empty() {
            errors.push(FieldError::new("name", "Please enter your name"));
        } else if name.chars().count() > 100 {
            errors.push(FieldError::new(
                "name",
                "Your name cannot be longer than 100 characters",
            ));
        } else if !NAME_RE.is_match(name) {
            errors.push(FieldError::new("name", "Your name contains invalid characters"));
        }
    }

    fn check_email(email: &str, errors: &mut Vec<FieldError>) {
        let email = email.trim();
        if email.is_empty() {
            errors.push(FieldError::new("email", "Please enter your email address"));
        } else if !EMAIL_RE.is_match(email) {
            errors.push(FieldError::new(
                "email",
                "Please enter a valid email address with ASCII characters only",
            ));
        }
    }

    fn check_message(message: &str, errors: &mut Vec<FieldError>) {
        let message = message.trim();
        let len = message.chars().count();
        if message.is_empty() {
            errors.push(FieldError::new("message", "Please enter your message"));
        } else if len < 10 {
            errors.push(FieldError::new(
                "message",
                "Your message must be at least 10 characters",
            ));
        } else if len > 500 {
            errors.push(FieldError::new(
                "message",
                "Your message cannot be longer than 500 characters",
            ));
        } else if !MESSAGE_RE.is_match(message) {
            errors.push(FieldError::new("message", "Your message contains invalid characters"));
        }
    }

    fn check_phone(phone: Option<&str>, errors: &mut Vec<FieldError>) {
        match phone.map(str::trim) {
            Some(p) if !p.is_empty() && !PHONE_RE.is_match(p) => {
                errors.push(FieldError::new("phone", "Please enter a valid phone number"));
            }
            _ => {}
        }
    }
}

impl FormValidator for ContactFormValidator {
    fn validate(&self, form: &ContactForm) -> Vec<FieldError> {
        let mut errors = Vec::new();

        Self::check_name(&form.name, &mut errors);
        Self::check_email(&form.email, &mut errors);
        Self::check_message(&form.message, &mut errors);
        Self::check_phone(form.phone.as_deref(), &mut errors);

        let coaching = form.service_type == Some(ServiceType::Coaching);
        let project = form.service_type == Some(ServiceType::Project);

        // Conditional fields only count for their own service type
        if project {
            TextRule {
                field: "company",
                label: "Company name",
                length: Length { min: 1, max: 100 },
                pattern: &COMPANY_RE,
                required: false,
            }
            .check(form.company.as_deref(), &mut errors);

            TextRule {
                field: "job_role",
                label: "Job role",
                length: Length { min: 1, max: 100 },
                pattern: &JOB_ROLE_RE,
                required: false,
            }
            .check(form.job_role.as_deref(), &mut errors);

            TextRule {
                field: "project_description",
                label: "Project description",
                length: Length { min: 10, max: 1000 },
                pattern: &LONG_TEXT_RE,
                required: true,
            }
            .check(form.project_description.as_deref(), &mut errors);
        }

        if coaching {
            TextRule {
                field: "professional_status",
                label: "Professional status",
                length: Length { min: 10, max: 500 },
                pattern: &LONG_TEXT_RE,
                required: true,
            }
            .check(form.professional_status.as_deref(), &mut errors);

            TextRule {
                field: "coaching_goals",
                label: "Coaching goals",
                length: Length { min: 10, max: 500 },
                pattern: &LONG_TEXT_RE,
                required: true,
            }
            .check(form.coaching_goals.as_deref(), &mut errors);
        }

        errors
    }
}
