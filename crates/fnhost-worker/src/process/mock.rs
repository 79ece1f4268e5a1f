// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock process factory for testing.
//!
//! Launches no OS processes. Every "process" is controlled from the test
//! through a [`MockProcessControl`].

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::traits::{OutputStream, ProcessExit, ProcessFactory, ProcessHandle, SpawnedProcess};
use crate::context::WorkerContext;
use crate::error::ProcessCreationError;

const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

struct MockProcessState {
    pid: u32,
    exit: watch::Sender<Option<ProcessExit>>,
    terminate_requested: AtomicBool,
    killed: AtomicBool,
    ignore_terminate: bool,
}

impl MockProcessState {
    fn finish(&self, exit: ProcessExit) {
        self.exit.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
    }
}

/// Test-side control of a mock process.
#[derive(Clone)]
pub struct MockProcessControl {
    state: Arc<MockProcessState>,
}

impl MockProcessControl {
    /// Pid assigned to the process.
    pub fn pid(&self) -> u32 {
        self.state.pid
    }

    /// Make the process exit with `code`.
    pub fn exit(&self, code: i32) {
        self.state.finish(ProcessExit::code(code));
    }

    /// Make the process die from `signal`.
    pub fn crash_with_signal(&self, signal: i32) {
        self.state.finish(ProcessExit::signaled(signal));
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&self) -> bool {
        self.state.exit.borrow().is_none()
    }

    /// Whether a graceful terminate was requested.
    pub fn terminate_requested(&self) -> bool {
        self.state.terminate_requested.load(Ordering::SeqCst)
    }

    /// Whether the process was force-killed.
    pub fn was_killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }
}

struct MockProcess {
    state: Arc<MockProcessState>,
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.state.pid)
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let mut rx = self.state.exit.subscribe();
        let exit = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| std::io::Error::other("mock process state dropped"))?;
        exit.ok_or_else(|| std::io::Error::other("mock process has no exit status"))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.state.terminate_requested.store(true, Ordering::SeqCst);
        if !self.state.ignore_terminate {
            self.state.finish(ProcessExit::signaled(SIGTERM));
        }
        Ok(())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.state.killed.store(true, Ordering::SeqCst);
        self.state.finish(ProcessExit::signaled(SIGKILL));
        Ok(())
    }
}

/// Mock process factory.
///
/// Records every launch context and hands out controllable processes.
pub struct MockProcessFactory {
    next_pid: AtomicU32,
    fail_with: Mutex<Option<ErrorKind>>,
    spawn_delay: Duration,
    ignore_terminate: bool,
    stderr_output: Option<String>,
    launches: Mutex<Vec<(WorkerContext, MockProcessControl)>>,
}

impl Default for MockProcessFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessFactory {
    /// Create a factory whose processes exit promptly on terminate.
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(10_000),
            fail_with: Mutex::new(None),
            spawn_delay: Duration::ZERO,
            ignore_terminate: false,
            stderr_output: None,
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Processes ignore graceful termination and must be killed.
    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }

    /// Delay every launch by `delay`.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    /// Every process writes `output` to stderr immediately.
    pub fn with_stderr(mut self, output: impl Into<String>) -> Self {
        self.stderr_output = Some(output.into());
        self
    }

    /// Fail subsequent launches with an I/O error of `kind`.
    pub fn fail_launches(&self, kind: ErrorKind) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }

    /// Let subsequent launches succeed again.
    pub fn succeed_launches(&self) {
        *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of successful launches.
    pub fn launch_count(&self) -> usize {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Contexts of all successful launches, oldest first.
    pub fn launched_contexts(&self) -> Vec<WorkerContext> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(ctx, _)| ctx.clone())
            .collect()
    }

    /// Control of the most recent process.
    pub fn last_process(&self) -> Option<MockProcessControl> {
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|(_, control)| control.clone())
    }
}

#[async_trait]
impl ProcessFactory for MockProcessFactory {
    fn factory_type(&self) -> &'static str {
        "mock"
    }

    async fn create_process(
        &self,
        context: &WorkerContext,
    ) -> Result<SpawnedProcess, ProcessCreationError> {
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }

        let failure = *self.fail_with.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(kind) = failure {
            return Err(ProcessCreationError::from_spawn(
                &context.arguments.executable_path,
                std::io::Error::from(kind),
            ));
        }

        let (exit, _) = watch::channel(None);
        let state = Arc::new(MockProcessState {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            exit,
            terminate_requested: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            ignore_terminate: self.ignore_terminate,
        });
        let control = MockProcessControl {
            state: state.clone(),
        };
        self.launches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((context.clone(), control));

        let stderr = self
            .stderr_output
            .clone()
            .map(|s| Box::new(std::io::Cursor::new(s.into_bytes())) as OutputStream);

        Ok(SpawnedProcess {
            handle: Box::new(MockProcess { state }),
            stdout: None,
            stderr,
        })
    }
}
