// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process factory trait definitions.

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::context::WorkerContext;
use crate::error::ProcessCreationError;

/// Output stream of a worker process.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// Exit code if the process exited on its own.
    pub exit_code: Option<i32>,
    /// Terminating signal (unix).
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Process exited with the given code.
    pub fn code(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            signal: None,
        }
    }

    /// Process was terminated by a signal.
    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: None,
            signal: Some(signal),
        }
    }

    /// Whether the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Handle to a launched worker process.
///
/// `wait` must be cancel-safe: the supervisor races it against stop
/// requests and may drop the future before it completes.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Ask the process to terminate gracefully (SIGTERM on unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force-kill the process.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly launched process together with its output streams.
pub struct SpawnedProcess {
    /// Lifecycle handle.
    pub handle: Box<dyn ProcessHandle>,
    /// Captured stdout, if piped.
    pub stdout: Option<OutputStream>,
    /// Captured stderr, if piped.
    pub stderr: Option<OutputStream>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.handle.pid())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Creates OS processes for worker contexts.
///
/// Factories are pure launchers: they know nothing about events, restarts,
/// or channel state.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    /// Factory type identifier (e.g. "native", "mock").
    fn factory_type(&self) -> &'static str;

    /// Launch a worker process for `context`.
    async fn create_process(
        &self,
        context: &WorkerContext,
    ) -> Result<SpawnedProcess, ProcessCreationError>;
}
