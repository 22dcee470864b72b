//! Exit outcome derivation and the completion callback.

use std::fmt;
use std::io;

use crate::error::INTERNAL_ERROR_EXIT_CODE;

/// Exit code reported when an interactive process ended without a
/// derivable status; it had started, so it was killed or interrupted.
pub const INTERRUPTED_EXIT_CODE: i32 = 1;

/// Final result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: i32,
    pub message: String,
}

impl ExitOutcome {
    pub fn new(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    /// Outcome of waiting on a pipe-mode process.
    ///
    /// A process without an exit status (killed by a signal) or a failed
    /// wait is reported with the internal-error sentinel.
    pub fn from_pipe_wait(result: io::Result<std::process::ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => Self::new(0, ""),
            Ok(status) => match status.code() {
                Some(code) => Self::new(code, format!("command exited with status {code}")),
                None => Self::new(
                    INTERNAL_ERROR_EXIT_CODE,
                    format!("command terminated abnormally, status={status}"),
                ),
            },
            Err(e) => Self::new(
                INTERNAL_ERROR_EXIT_CODE,
                format!("failed executing command, err={e}"),
            ),
        }
    }

    /// Outcome of waiting on a PTY process.
    ///
    /// Anything without a usable status maps to [`INTERRUPTED_EXIT_CODE`].
    pub fn from_tty_wait<E: fmt::Display>(result: Result<portable_pty::ExitStatus, E>) -> Self {
        match result {
            Ok(status) if status.success() => Self::new(0, ""),
            Ok(status) => {
                let code = i32::try_from(status.exit_code())
                    .ok()
                    .filter(|code| *code != 0)
                    .unwrap_or(INTERRUPTED_EXIT_CODE);
                Self::new(code, format!("command exited with status {code}"))
            }
            Err(e) => Self::new(
                INTERRUPTED_EXIT_CODE,
                format!("failed executing command, err={e}"),
            ),
        }
    }
}

type OnExecEnd = Box<dyn FnOnce(i32, String) + Send + 'static>;

/// Completion callback of one execution.
///
/// `report` consumes the reporter, so the callback fires at most once; every
/// path that owns a reporter ends by reporting.
pub struct ExitReporter {
    callback: OnExecEnd,
}

impl ExitReporter {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(i32, String) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    pub fn report(self, exit_code: i32, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(exit_code, message = %message, "execution finished");
        (self.callback)(exit_code, message);
    }

    pub fn report_outcome(self, outcome: ExitOutcome) {
        self.report(outcome.exit_code, outcome.message);
    }
}

impl fmt::Debug for ExitReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExitReporter").finish_non_exhaustive()
    }
}
