//! Error types for the pdf2md-pool library.
//!
//! Three layers reflect three distinct failure scopes:
//!
//! * [`PoolError`]: **Fatal**: the pool cannot be built or started at all
//!   (invalid configuration, provider not configured). Returned as
//!   `Err(PoolError)` from constructors, never from `submit`.
//!
//! * [`PhaseError`]: **Per attempt**: the local or remote phase of one
//!   attempt failed. The retry supervisor absorbs these up to its budget.
//!
//! * [`FailureKind`]: **Per request**: the classification carried by a
//!   failed [`crate::output::WorkResult`]. Callers always get a well-formed
//!   result; raw internal errors never cross the `submit` boundary.
//!
//! [`CleanupFailure`] is the odd one out: it is returned by scratch-area
//! release so the worker can log it, and goes no further.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors returned while configuring or starting the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The scratch root or another OS resource could not be allocated.
    #[error("Resource allocation failed under '{root}': {source}")]
    Resource {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure inside one attempt of one unit of work.
///
/// Carried through the retry loop; only its message survives into the
/// terminal [`crate::output::WorkResult`].
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum PhaseError {
    /// The local preprocessing routine rejected or failed on the input.
    #[error("preprocessing failed: {0}")]
    Preprocess(String),

    /// The remote inference call failed (connection, capacity, bad reply).
    #[error("inference failed: {0}")]
    Inference(String),

    /// Permit wait plus remote call exceeded the attempt timeout.
    #[error("remote phase timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The phase panicked or its blocking task was aborted.
    #[error("phase panicked: {0}")]
    Panicked(String),

    /// A gate was closed while waiting for admission.
    #[error("gate closed: {0}")]
    Gate(String),
}

/// Classification of a terminal failure, as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Health probe reported the backend down and the retry budget ran out.
    BackendUnavailable,
    /// The local or remote phase kept failing until the budget ran out.
    PhaseFailure,
    /// The scratch area could not be allocated. Never retried.
    ResourceError,
    /// The executor was shut down before the request could be scheduled.
    ExecutorClosed,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::BackendUnavailable => "backend unavailable",
            FailureKind::PhaseFailure => "phase failure",
            FailureKind::ResourceError => "resource error",
            FailureKind::ExecutorClosed => "executor closed",
        };
        f.write_str(s)
    }
}

/// Scratch-area removal failed. Logged by the worker, never surfaced.
#[derive(Debug, Error)]
#[error("failed to remove scratch area '{path}': {source}")]
pub struct CleanupFailure {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn phase_timeout_display() {
        let e = PhaseError::Timeout { secs: 30 };
        assert!(e.to_string().contains("30s"), "got: {e}");
    }

    #[test]
    fn failure_kind_serialises_snake_case() {
        let json = serde_json::to_string(&FailureKind::BackendUnavailable).unwrap();
        assert_eq!(json, "\"backend_unavailable\"");
    }

    #[test]
    fn resource_error_names_root() {
        let e = PoolError::Resource {
            root: PathBuf::from("/scratch"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let msg = e.to_string();
        assert!(msg.contains("/scratch"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn cleanup_failure_display() {
        let e = CleanupFailure {
            path: PathBuf::from("/tmp/x"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(e.to_string().contains("/tmp/x"));
    }
}
