use serde::{Deserialize, Serialize};

/// Outcome of one guardrail check for one user turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailVerdict {
    pub name: String,
    pub input: String,
    pub passed: bool,
    pub reasoning: String,
}

impl GuardrailVerdict {
    pub fn pass(name: impl Into<String>, input: &str, reasoning: impl Into<String>) -> Self {
        Self { name: name.into(), input: input.to_owned(), passed: true, reasoning: reasoning.into() }
    }

    pub fn fail(name: impl Into<String>, input: &str, reasoning: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.to_owned(),
            passed: false,
            reasoning: reasoning.into(),
        }
    }
}
