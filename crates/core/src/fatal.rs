//! Fatal-error delivery for background pipelines.
//!
//! A background applier that fails to commit a changeset cannot return the
//! error to anyone: the caller already got `Ok` when the changeset was
//! enqueued. Continuing would silently drop a commit, so the failure is
//! handed to a [`Supervisor`], which owns the decision to stop the process.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::error;

/// An unrecoverable failure raised by a background component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    /// Component that failed (e.g. `"mvcc-applier"`)
    pub component: &'static str,
    /// Rendered cause
    pub message: String,
}

impl FatalError {
    /// Build a fatal error.
    pub fn new(component: &'static str, cause: impl fmt::Display) -> Self {
        FatalError {
            component,
            message: cause.to_string(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal error in {}: {}", self.component, self.message)
    }
}

impl From<FatalError> for crate::Error {
    fn from(e: FatalError) -> Self {
        crate::Error::Fatal {
            component: e.component,
            message: e.message,
        }
    }
}

/// Receives fatal errors and terminates whatever must be terminated.
pub trait Supervisor: Send + Sync {
    /// Called once per fatal failure, from the failing thread.
    fn on_fatal(&self, err: FatalError);
}

/// Logs the failure and aborts the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortSupervisor;

impl Supervisor for AbortSupervisor {
    fn on_fatal(&self, err: FatalError) {
        error!(component = err.component, error = %err.message, "fatal storage error, aborting");
        std::process::abort();
    }
}

/// Records fatal errors instead of terminating. Used by tests and by hosts
/// that run their own shutdown sequence.
#[derive(Debug, Default)]
pub struct RecordingSupervisor {
    errors: Mutex<Vec<FatalError>>,
}

impl RecordingSupervisor {
    /// New, empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSupervisor::default())
    }

    /// Errors recorded so far.
    pub fn errors(&self) -> Vec<FatalError> {
        self.errors.lock().clone()
    }

    /// Whether any fatal error was recorded.
    pub fn has_failed(&self) -> bool {
        !self.errors.lock().is_empty()
    }
}

impl Supervisor for RecordingSupervisor {
    fn on_fatal(&self, err: FatalError) {
        error!(component = err.component, error = %err.message, "fatal storage error recorded");
        self.errors.lock().push(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_supervisor_collects() {
        let sup = RecordingSupervisor::new();
        assert!(!sup.has_failed());
        sup.on_fatal(FatalError::new("mvcc-applier", "write failed"));
        assert!(sup.has_failed());
        assert_eq!(sup.errors()[0].component, "mvcc-applier");
    }

    #[test]
    fn test_fatal_into_error() {
        let err: crate::Error = FatalError::new("import", "batch commit").into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("batch commit"));
    }
}
