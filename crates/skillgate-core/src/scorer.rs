//! Fidelity scoring: how faithfully an execution followed its skill, and
//! whether it reached the expected outcome.

use serde_json::Value;

use crate::domain::ValidationPattern;

#[derive(Debug, Clone, Copy, Default)]
pub struct FidelityScorer;

impl FidelityScorer {
    /// Check one step's output against its pattern.
    pub fn validate(&self, output: &Value, pattern: &ValidationPattern) -> Result<(), String> {
        pattern.evaluate(output)
    }

    /// `passed / attempted`, clamped to `[0, 1]`. Zero attempts score zero.
    pub fn fidelity(&self, passed: usize, attempted: usize) -> f64 {
        if attempted == 0 {
            return 0.0;
        }
        (passed as f64 / attempted as f64).clamp(0.0, 1.0)
    }

    /// `None` without an expectation; `Some(false)` when the chain did not
    /// complete; otherwise whether the final output satisfies `expected`.
    pub fn outcome(
        &self,
        expected: Option<&ValidationPattern>,
        final_output: Option<&Value>,
        completed: bool,
    ) -> Option<bool> {
        let expected = expected?;
        if !completed {
            return Some(false);
        }
        Some(
            final_output
                .map(|out| expected.evaluate(out).is_ok())
                .unwrap_or(false),
        )
    }
}
