// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process backend using `tokio::process`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::traits::{OutputStream, ProcessExit, ProcessFactory, ProcessHandle, SpawnedProcess};
use crate::context::WorkerContext;
use crate::error::ProcessCreationError;

/// Launches worker executables as child processes of the host.
///
/// The child inherits the host environment with the context environment
/// layered on top, runs with the script root as working directory, and has
/// stdout and stderr piped back for logging.
#[derive(Debug, Clone, Default)]
pub struct NativeProcessFactory;

impl NativeProcessFactory {
    /// Create a native factory.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessFactory for NativeProcessFactory {
    fn factory_type(&self) -> &'static str {
        "native"
    }

    async fn create_process(
        &self,
        context: &WorkerContext,
    ) -> Result<SpawnedProcess, ProcessCreationError> {
        let executable = &context.arguments.executable_path;
        let mut cmd = Command::new(executable);
        cmd.args(context.command_line_args())
            .envs(&context.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // A missing working directory would surface as NotFound and be
        // misreported as a missing executable.
        if context.script_root_path.is_dir() {
            cmd.current_dir(&context.script_root_path);
        } else {
            debug!(
                worker_id = %context.worker_id,
                script_root = %context.script_root_path.display(),
                "Script root does not exist, inheriting host working directory"
            );
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProcessCreationError::from_spawn(executable, e))?;

        let stdout = child.stdout.take().map(|s| Box::new(s) as OutputStream);
        let stderr = child.stderr.take().map(|s| Box::new(s) as OutputStream);

        info!(
            worker_id = %context.worker_id,
            request_id = %context.request_id,
            pid = ?child.id(),
            executable = %executable,
            "Spawned worker process"
        );

        Ok(SpawnedProcess {
            handle: Box::new(NativeProcess { child }),
            stdout,
            stderr,
        })
    }
}

/// Handle to a native child process.
struct NativeProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for NativeProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.child.wait().await?;

        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Ok(ProcessExit {
            exit_code: status.code(),
            signal,
        })
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        // No pid means the child has already been reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}
