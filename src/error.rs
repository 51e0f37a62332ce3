//! Error types for forkbuild.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for forkbuild.
#[derive(Error, Debug)]
pub enum ForkbuildError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System call failed: {0}")]
    Errno(#[from] nix::Error),

    /// A requirement named by `origin` could not be resolved.
    #[error("A file required by {origin:?} wasn't found")]
    MissingRequire {
        origin: String,
        #[source]
        cause: RemoteError,
    },

    /// Any other failure raised inside a worker, re-raised verbatim.
    #[error("{0}")]
    WorkerFault(RemoteError),

    /// A worker went away while it still owed us a reply.
    #[error("Worker {pid} went away with {in_flight} compile(s) in flight: {reason}")]
    WorkerLost {
        pid: i32,
        in_flight: usize,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ForkbuildError {
    /// The error shipped back from a worker, if this failure came from one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::MissingRequire { cause, .. } => Some(cause),
            Self::WorkerFault(error) => Some(error),
            _ => None,
        }
    }
}

/// Result type alias for forkbuild operations.
pub type Result<T> = std::result::Result<T, ForkbuildError>;

/// An error captured inside a worker process and shipped to the orchestrator.
///
/// Errors cannot cross a pipe as trait objects, so the worker flattens the
/// failure into its message, the messages of its sources and an optional
/// backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            chain: Vec::new(),
            trace: None,
        }
    }

    /// Flatten any error and its `source()` chain.
    ///
    /// Sources whose text the message already spells out (the usual
    /// `#[error("...: {0}")]` pattern) are left out of `chain`.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let message = err.to_string();
        let mut chain: Vec<String> = Vec::new();
        let mut shown = message.clone();
        let mut source = err.source();
        while let Some(cause) = source {
            let text = cause.to_string();
            if !shown.contains(&text) {
                shown.push_str(&text);
                chain.push(text);
            }
            source = cause.source();
        }
        Self {
            message,
            chain,
            trace: None,
        }
    }

    /// Build from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker panicked".to_string()
        };
        Self::new(format!("worker panicked: {}", message))
    }

    /// Attach a backtrace captured at the failure site.
    ///
    /// Honors `RUST_BACKTRACE`; nothing is attached when capture is disabled.
    pub fn with_captured_trace(mut self) -> Self {
        let bt = std::backtrace::Backtrace::capture();
        if bt.status() == std::backtrace::BacktraceStatus::Captured {
            self.trace = Some(bt.to_string());
        }
        self
    }
}

/// Shows the message only; the flattened causes live in `chain`.
impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}
