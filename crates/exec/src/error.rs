//! Error types for the execution core.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// Exit code reported when the gateway itself fails before or around the
/// subprocess (setup faults, abnormal termination in pipe mode).
///
/// Chosen outside the range a shell assigns to its own failures so callers
/// can tell gateway faults apart from the program's exit status.
pub const INTERNAL_ERROR_EXIT_CODE: i32 = 254;

/// Exit code reported when the executable could not be found, mirroring the
/// shell convention.
pub const NOT_FOUND_EXIT_CODE: i32 = 127;

/// Errors raised while building or provisioning an [`EnvVarStore`].
///
/// [`EnvVarStore`]: crate::env::EnvVarStore
#[derive(Error, Debug)]
pub enum EnvError {
    /// A raw entry could not be decoded.
    #[error("malformed environment entry {name:?}: {reason}")]
    Malformed {
        /// The raw entry name as received.
        name: String,
        /// Why the entry was rejected.
        reason: String,
    },

    /// The entry name carries a kind prefix this store does not know.
    #[error("unknown environment kind {kind:?} in entry {name:?}")]
    UnknownKind {
        /// The raw entry name as received.
        name: String,
        /// The unrecognised prefix.
        kind: String,
    },

    /// Two entries resolve to the same variable name.
    #[error("environment variable {0:?} defined more than once")]
    Duplicate(String),

    /// An argument references a variable the store does not define.
    #[error("environment variable {0:?} referenced by the command is not defined")]
    Expansion(String),

    /// A pre-exec hook failed.
    #[error("failed provisioning environment variable {key:?}: {source}")]
    Hook {
        /// Key of the entry whose hook failed.
        key: String,
        /// The provisioner's error.
        #[source]
        source: anyhow::Error,
    },
}

/// Errors raised by a [`Command`] through its lifecycle.
///
/// [`Command`]: crate::command::Command
#[derive(Error, Debug)]
pub enum ExecError {
    /// The argument vector was empty.
    #[error("command must have at least one argument")]
    EmptyArgs,

    /// The environment definitions could not be resolved.
    #[error(transparent)]
    Env(#[from] EnvError),

    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A run operation was already invoked on this command.
    #[error("command already started")]
    AlreadyStarted,

    /// A pre-exec hook failed; the process was never started.
    #[error("failed executing pre command: {0}")]
    PreExec(#[source] EnvError),

    /// The executable could not be located.
    #[error("executable not found: {program}")]
    NotFound {
        /// Program as given in the argument vector.
        program: String,
    },

    /// The process could not be started for a reason other than a missing
    /// executable.
    #[error("failed starting command {program}: {source}")]
    Spawn {
        /// Program as given in the argument vector.
        program: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The standard streams of the process could not be wired.
    #[error("failed opening {0} pipe")]
    Pipe(&'static str),

    /// The buffered input could not be delivered to the process.
    #[error("failed writing input: {0}")]
    Stdin(#[source] io::Error),

    /// Pseudo-terminal allocation or setup failed.
    #[error("failed starting pty: {0}")]
    Pty(String),

    /// The pseudo-terminal was already released by teardown.
    #[error("tty closed")]
    TtyClosed,

    /// Writing to the pseudo-terminal failed.
    #[error("failed writing to tty: {0}")]
    TtyWrite(#[source] io::Error),

    /// Resizing the pseudo-terminal failed.
    #[error("failed resizing tty: {0}")]
    Resize(String),
}

impl ExecError {
    /// Classifies a spawn failure: a missing executable is reported apart
    /// from every other start fault.
    pub fn spawn(program: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ExecError::NotFound {
                program: program.to_string(),
            }
        } else {
            ExecError::Spawn {
                program: program.to_string(),
                source,
            }
        }
    }

    /// The exit code a completion callback reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::NotFound { .. } => NOT_FOUND_EXIT_CODE,
            _ => INTERNAL_ERROR_EXIT_CODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_not_found_maps_to_127() {
        let err = ExecError::spawn("nope", io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, ExecError::NotFound { .. }));
        assert_eq!(err.exit_code(), NOT_FOUND_EXIT_CODE);
    }

    #[test]
    fn test_spawn_other_maps_to_sentinel() {
        let err = ExecError::spawn(
            "/etc/passwd",
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, ExecError::Spawn { .. }));
        assert_eq!(err.exit_code(), INTERNAL_ERROR_EXIT_CODE);
    }

    #[test]
    fn test_pre_exec_error_mentions_key() {
        let err = ExecError::PreExec(EnvError::Hook {
            key: "TOKEN".to_string(),
            source: anyhow::anyhow!("vault unreachable"),
        });
        let msg = err.to_string();
        assert!(msg.contains("TOKEN"));
        assert!(msg.contains("vault unreachable"));
        assert_eq!(err.exit_code(), INTERNAL_ERROR_EXIT_CODE);
    }

    #[test]
    fn test_sentinel_is_distinct_from_not_found() {
        assert_ne!(INTERNAL_ERROR_EXIT_CODE, NOT_FOUND_EXIT_CODE);
        assert!(INTERNAL_ERROR_EXIT_CODE > 0 && INTERNAL_ERROR_EXIT_CODE < 256);
    }
}
