//! Result types produced by the pool.
//!
//! Every submitted [`crate::request::WorkRequest`] yields exactly one
//! [`WorkResult`]. Results are plain data (`Serialize`) so the boundary can
//! forward them as JSON without a second mapping layer.

use crate::error::FailureKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What the remote phase produced for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutput {
    /// The converted document (Markdown for the bundled VLM backend).
    pub content: String,
    /// Units processed (pages for PDFs).
    pub units: usize,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Terminal outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkOutcome {
    Success { output: WorkOutput },
    Failure { kind: FailureKind, message: String },
}

/// Outcome record for one request. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub request_id: Uuid,
    pub display_name: String,
    #[serde(flatten)]
    pub outcome: WorkOutcome,
    /// Attempts consumed, including ones cut short by an unhealthy backend.
    pub attempts: u32,
    /// Wall-clock time from the first attempt's start to the terminal state.
    pub elapsed_ms: u64,
}

impl WorkResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, WorkOutcome::Success { .. })
    }

    pub fn output(&self) -> Option<&WorkOutput> {
        match &self.outcome {
            WorkOutcome::Success { output } => Some(output),
            WorkOutcome::Failure { .. } => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            WorkOutcome::Success { .. } => None,
            WorkOutcome::Failure { kind, .. } => Some(*kind),
        }
    }

    /// Failure message, if any.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            WorkOutcome::Success { .. } => None,
            WorkOutcome::Failure { message, .. } => Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> WorkResult {
        WorkResult {
            request_id: Uuid::nil(),
            display_name: "x.pdf".into(),
            outcome: WorkOutcome::Failure {
                kind: FailureKind::PhaseFailure,
                message: "boom".into(),
            },
            attempts: 3,
            elapsed_ms: 12,
        }
    }

    #[test]
    fn accessors_on_failure() {
        let r = failed();
        assert!(!r.is_success());
        assert!(r.output().is_none());
        assert_eq!(r.failure_kind(), Some(FailureKind::PhaseFailure));
        assert_eq!(r.error(), Some("boom"));
    }

    #[test]
    fn json_is_flat_with_status_tag() {
        let v = serde_json::to_value(failed()).unwrap();
        assert_eq!(v["status"], "failure");
        assert_eq!(v["kind"], "phase_failure");
        assert_eq!(v["attempts"], 3);
    }
}
