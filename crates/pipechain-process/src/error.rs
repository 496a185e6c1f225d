//! Error types for process chains

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Process and chain errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The OS could not create the process
    #[error("Failed to spawn [{command}]: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A chain stage could not be started
    #[error("Command [{command}] triggered an error: [{source}]")]
    StageStart {
        command: String,
        #[source]
        source: Box<ProcessError>,
    },

    /// The process exited with a failure status
    #[error("Command [{command}] failed: {status}")]
    Stage { command: String, status: ExitStatus },

    /// Waiting on the process failed at the OS level
    #[error("Failed to wait on [{command}]: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The process exceeded its timeout and was killed
    #[error("Command [{command}] timed out after {after:?} with error: [{kill}]")]
    Timeout {
        command: String,
        after: Duration,
        kill: Box<ProcessError>,
    },

    /// A stop request was honored and the process was killed
    #[error("Command [{command}] was stopped with error: [{kill}]")]
    Cancelled {
        command: String,
        kill: Box<ProcessError>,
    },

    /// The process was killed. Produced even when the kill itself succeeded.
    #[error("Subprocess was killed: [{command}]")]
    Killed { command: String },

    /// The kill signal could not be delivered
    #[error("Failed to kill subprocess [{command}]: {source}")]
    KillFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Closing an inter-stage pipe failed
    #[error("Failed to close output pipe of [{command}]: {source}")]
    PipeClose {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Creating an inter-stage pipe failed
    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] io::Error),

    /// The chain-level stop signal fired
    #[error("Chain stopped")]
    ChainStopped,

    /// Output was requested from a chain without steps
    #[error("No commands are in this chain")]
    EmptyChain,

    /// Start was called on a command or chain that already ran
    #[error("[{command}] was already started; clone it to run again")]
    AlreadyStarted { command: String },

    /// Wait was called on a command or chain that is not running
    #[error("[{command}] is not running")]
    NotStarted { command: String },

    /// The output channel was already handed out
    #[error("Output stream of [{command}] was already taken")]
    StreamTaken { command: String },

    /// The background wait task failed
    #[error("Chain wait task failed: {0}")]
    Join(String),
}

impl ProcessError {
    /// True if a stage exceeded its timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True if a stop request (stage or chain level) ended the run
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. } | Self::ChainStopped)
    }

    /// True if a process ran to completion but reported failure
    pub fn is_stage_failure(&self) -> bool {
        matches!(self, Self::Stage { .. })
    }

    /// True if the process could not be spawned
    pub fn is_spawn_failure(&self) -> bool {
        match self {
            Self::Spawn { .. } => true,
            Self::StageStart { source, .. } => source.is_spawn_failure(),
            _ => false,
        }
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_carries_kill_outcome() {
        let err = ProcessError::Timeout {
            command: "sleep 5".to_string(),
            after: Duration::from_millis(100),
            kill: Box::new(ProcessError::Killed {
                command: "sleep 5".to_string(),
            }),
        };

        let message = err.to_string();
        assert!(message.contains("timed out"));
        assert!(message.contains("Subprocess was killed: [sleep 5]"));
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_stage_start_classification() {
        let err = ProcessError::StageStart {
            command: "nope --flag".to_string(),
            source: Box::new(ProcessError::Spawn {
                command: "nope --flag".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "not found"),
            }),
        };

        assert!(err.is_spawn_failure());
        assert!(err.to_string().starts_with("Command [nope --flag] triggered an error"));
    }

    #[test]
    fn test_chain_stopped_is_cancellation() {
        assert!(ProcessError::ChainStopped.is_cancelled());
        assert_eq!(ProcessError::EmptyChain.to_string(), "No commands are in this chain");
    }
}
