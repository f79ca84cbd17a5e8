//! The uniform subprocess error and its normalization rules
//!
//! Every failure source - a spawn error, a non-zero exit, a signal, a broken
//! stdio stream, a cancellation, or a rejected configuration - collapses into
//! the single [`SubprocessError`] shape. The originating error, when there is
//! one, rides along in `cause`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::process::Settled;

/// The originating error carried by a [`SubprocessError`].
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Uniform error produced when a subprocess fails for any reason.
///
/// Exactly one of `exit_code` / `signal_name` is set when the process ran and
/// failed; both are `None` for pre-spawn, configuration, stream, and
/// cancellation failures, in which case `cause` holds the originating error.
#[derive(Debug, Clone)]
pub struct SubprocessError {
    /// Human-readable failure description, deterministic per failure class.
    pub message: String,
    /// The program and its arguments as a single rendered line.
    pub command: String,
    /// Exit code, when the process exited on its own with a non-zero status.
    pub exit_code: Option<i32>,
    /// Name of the terminating signal (e.g. `"SIGTERM"`), when one was delivered.
    pub signal_name: Option<String>,
    /// Stdout captured before the failure; empty for pre-spawn failures.
    pub stdout: String,
    /// Stderr captured before the failure; empty for pre-spawn failures.
    pub stderr: String,
    /// Combined output captured before the failure.
    pub output: String,
    /// The originating error for failures that did not come from an exit status.
    pub cause: Option<Cause>,
    /// Time from subprocess creation to settlement.
    pub duration: Duration,
    /// Settled result of the upstream pipeline stage, when this process was
    /// produced by [`Subprocess::pipe`](crate::Subprocess::pipe) and the
    /// upstream settled first.
    pub piped_from: Option<Arc<Settled>>,
}

impl SubprocessError {
    /// Build a normalized error from the raw failure facts.
    ///
    /// The message is chosen by failure class: exit code, signal, or anything
    /// else ("Command failed: ...").
    pub(crate) fn normalized(
        command: &str,
        exit_code: Option<i32>,
        signal_name: Option<String>,
        stdout: String,
        stderr: String,
        output: String,
        cause: Option<Cause>,
        duration: Duration,
    ) -> Self {
        let message = match (exit_code, signal_name.as_deref()) {
            (Some(code), None) => format!("Command failed with exit code {code}: {command}"),
            (_, Some(signal)) => format!("Command was terminated with {signal}: {command}"),
            _ => format!("Command failed: {command}"),
        };
        Self {
            message,
            command: command.to_string(),
            exit_code,
            signal_name,
            stdout,
            stderr,
            output,
            cause,
            duration,
            piped_from: None,
        }
    }

    /// Failure that never reached the running state: spawn errors and
    /// synchronous configuration errors. Output fields are forced empty.
    pub(crate) fn early(command: &str, cause: Cause, duration: Duration) -> Self {
        Self::normalized(
            command,
            None,
            None,
            String::new(),
            String::new(),
            String::new(),
            Some(cause),
            duration,
        )
    }
}

impl fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SubprocessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

/// Invalid spawn or pipeline configuration, detected before anything is spawned.
#[derive(Debug, Error)]
#[error("invalid configuration: {reason}")]
pub struct ConfigError {
    /// What was wrong with the configuration.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Caller-requested cancellation, carried as the `cause` of the resulting
/// [`SubprocessError`].
#[derive(Debug, Error)]
#[error("command cancelled: {reason}")]
pub struct Cancelled {
    /// The reason supplied to [`CancelHandle::cancel`](crate::CancelHandle::cancel).
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_message() {
        let err = SubprocessError::normalized(
            "sh -c 'exit 2'",
            Some(2),
            None,
            String::new(),
            String::new(),
            String::new(),
            None,
            Duration::ZERO,
        );
        assert_eq!(err.message, "Command failed with exit code 2: sh -c 'exit 2'");
        assert_eq!(err.to_string(), err.message);
    }

    #[test]
    fn signal_message() {
        let err = SubprocessError::normalized(
            "sleep 60",
            None,
            Some("SIGTERM".to_string()),
            String::new(),
            String::new(),
            String::new(),
            None,
            Duration::ZERO,
        );
        assert_eq!(err.message, "Command was terminated with SIGTERM: sleep 60");
    }

    #[test]
    fn generic_message_for_early_failures() {
        let cause: Cause = Arc::new(ConfigError::new("empty program name"));
        let err = SubprocessError::early("", cause, Duration::ZERO);
        assert_eq!(err.message, "Command failed: ");
        assert!(err.exit_code.is_none());
        assert!(err.signal_name.is_none());
        assert_eq!(err.stdout, "");
        assert_eq!(err.output, "");
    }

    #[test]
    fn source_exposes_cause() {
        use std::error::Error as _;

        let cause: Cause = Arc::new(Cancelled {
            reason: "shutdown".to_string(),
        });
        let err = SubprocessError::early("sleep 60", cause, Duration::ZERO);
        let source = err.source().expect("cause should be exposed as source");
        assert!(source.to_string().contains("shutdown"));
    }
}
