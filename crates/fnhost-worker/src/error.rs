// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-worker.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The worker executable could not be launched.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessCreationError {
    /// Executable was not found.
    #[error("Worker executable not found: {0}")]
    ExecutableNotFound(String),

    /// Executable exists but may not be executed.
    #[error("Permission denied launching worker executable: {0}")]
    PermissionDenied(String),

    /// Any other spawn failure.
    #[error("Failed to launch worker process {path}: {source}")]
    Spawn {
        /// Executable that failed to launch.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ProcessCreationError {
    /// Classify a spawn error for the given executable path.
    pub fn from_spawn(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::ExecutableNotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Spawn {
                path: path.to_string(),
                source: err,
            },
        }
    }
}

/// A worker process terminated outside of an intentional stop.
///
/// Carried by `HostEvent::WorkerError`; never returned from a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("Worker process exited (pid={pid:?}, exit_code={exit_code:?}, signal={signal:?}): {stderr_tail}")]
pub struct WorkerExitError {
    /// Process id, if the backend exposes one.
    pub pid: Option<u32>,
    /// Exit code when the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
    /// Last lines written to stderr before the exit.
    pub stderr_tail: String,
}

/// Worker errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// Worker process failed to launch.
    #[error(transparent)]
    ProcessCreation(#[from] ProcessCreationError),

    /// Lifecycle method invoked in a state that does not allow it.
    #[error("Cannot {operation} worker in state {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the worker was in.
        state: String,
    },

    /// Status probe did not answer in time.
    #[error("Worker {worker_id} did not answer status probe within {}ms", .timeout.as_millis())]
    ChannelUnresponsive {
        /// Worker that timed out.
        worker_id: String,
        /// Probe timeout.
        timeout: Duration,
    },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// RPC connection lifecycle failed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using [`WorkerError`].
pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spawn_not_found() {
        let err = ProcessCreationError::from_spawn(
            "/opt/worker/node",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, ProcessCreationError::ExecutableNotFound(ref p) if p == "/opt/worker/node"));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_from_spawn_permission_denied() {
        let err = ProcessCreationError::from_spawn(
            "/opt/worker/python",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, ProcessCreationError::PermissionDenied(_)));
    }

    #[test]
    fn test_invalid_state_message() {
        let err = WorkerError::InvalidState {
            operation: "stop",
            state: "Created".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot stop worker in state Created");
    }

    #[test]
    fn test_exit_error_message_includes_pid() {
        let err = WorkerExitError {
            pid: Some(4242),
            exit_code: Some(137),
            signal: None,
            stderr_tail: "out of memory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("4242"));
        assert!(msg.contains("out of memory"));
    }
}
