//! # Humble Common
//!
//! Shared types, errors, and constants used by the contact gate.
//!
//! ## Modules
//! - `types` - Core data structures (RateLimitRecord, ContactForm, SubmissionOutcome, etc.)
//! - `error` - Common error types
//! - `constants` - Policy numbers, Redis keys, header names

pub mod constants;
pub mod error;
pub mod types;

pub use error::GateError;
pub use types::*;
