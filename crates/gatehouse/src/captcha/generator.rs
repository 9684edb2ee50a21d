//! Math challenge generation.
//!
//! Three templates, picked uniformly:
//! - `a + b` with a, b in 1..=10
//! - `a - b` with a in 5..=15, b in 1..=5 (never negative)
//! - `a * b` with a, b in 2..=5

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use humble_common::{IssuedChallenge, MathOperator};
use rand::Rng;

/// An arithmetic question and its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MathChallenge {
    pub operand_a: i64,
    pub operand_b: i64,
    pub operator: MathOperator,
}

impl MathChallenge {
    /// Pick one of the templates at random
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let (operator, operand_a, operand_b) = match rng.random_range(0..3) {
            0 => (
                MathOperator::Add,
                rng.random_range(1..=10),
                rng.random_range(1..=10),
            ),
            1 => (
                MathOperator::Subtract,
                rng.random_range(5..=15),
                rng.random_range(1..=5),
            ),
            _ => (
                MathOperator::Multiply,
                rng.random_range(2..=5),
                rng.random_range(2..=5),
            ),
        };

        Self {
            operand_a,
            operand_b,
            operator,
        }
    }

    pub fn answer(&self) -> i64 {
        self.operator.apply(self.operand_a, self.operand_b)
    }

    pub fn question(&self) -> String {
        format!(
            "What is {} {} {}?",
            self.operand_a,
            self.operator.symbol(),
            self.operand_b
        )
    }

    /// Attach an ID for handing out
    pub fn issue(&self, challenge_id: String) -> IssuedChallenge {
        IssuedChallenge {
            challenge_id,
            question: self.question(),
            answer: self.answer(),
        }
    }
}

/// Generate a cryptographically random challenge ID
pub fn generate_challenge_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
