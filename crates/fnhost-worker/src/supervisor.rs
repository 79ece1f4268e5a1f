// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker process supervision.
//!
//! A [`WorkerProcessSupervisor`] owns exactly one worker process at a time.
//! It launches the process through a [`ProcessFactory`], forwards its output
//! to the log, and watches for exit. What happens on an unexpected exit is
//! decided by a [`WorkerProcessStrategy`]; the supervisor itself never
//! restarts anything.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{WorkerContext, WorkerContextBuilder};
use crate::error::{Result, WorkerError, WorkerExitError};
use crate::events::{EventBus, HostEvent};
use crate::process::{OutputStream, ProcessExit, ProcessFactory, ProcessHandle, SpawnedProcess};

/// How long exit handling waits for output readers to drain.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for a [`WorkerProcessSupervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time a worker gets to exit after SIGTERM before it is killed.
    pub graceful_stop_timeout: Duration,
    /// Treat every stderr line as an error.
    pub stderr_errors_only: bool,
    /// Number of stderr lines kept for exit diagnostics.
    pub stderr_tail_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_stop_timeout: Duration::from_secs(5),
            stderr_errors_only: false,
            stderr_tail_lines: 10,
        }
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Never started.
    Idle,
    /// Launch in progress.
    Starting,
    /// Process is alive; exits are unexpected.
    Running,
    /// Intentional stop in progress; exits are expected.
    Stopping,
    /// No process.
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Pluggable behavior of a supervised worker.
///
/// `on_exit` and `on_restart_needed` are called from the monitor task, in
/// that order, once per unexpected exit. They must not block.
pub trait WorkerProcessStrategy: Send + Sync {
    /// Build the launch descriptor for the next process start.
    fn create_launch_context(&self) -> WorkerContext;

    /// The process exited while it was supposed to be running.
    fn on_exit(&self, error: &WorkerExitError);

    /// The exited process should be replaced.
    fn on_restart_needed(&self);
}

/// Strategy for RPC language workers: reports exits on the host event bus.
pub struct RpcWorkerStrategy {
    runtime: String,
    context_builder: WorkerContextBuilder,
    bus: EventBus,
}

impl RpcWorkerStrategy {
    /// Create a strategy for `runtime` publishing on `bus`.
    pub fn new(
        runtime: impl Into<String>,
        context_builder: WorkerContextBuilder,
        bus: EventBus,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            context_builder,
            bus,
        }
    }

    /// Runtime name carried on published events.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }
}

impl WorkerProcessStrategy for RpcWorkerStrategy {
    fn create_launch_context(&self) -> WorkerContext {
        self.context_builder.build()
    }

    fn on_exit(&self, error: &WorkerExitError) {
        error!(
            runtime = %self.runtime,
            worker_id = %self.context_builder.worker_id(),
            pid = ?error.pid,
            exit_code = ?error.exit_code,
            signal = ?error.signal,
            "Language worker process exited unexpectedly"
        );
        self.bus.publish(HostEvent::worker_error(
            &self.runtime,
            self.context_builder.worker_id(),
            error.clone(),
        ));
    }

    fn on_restart_needed(&self) {
        info!(
            runtime = %self.runtime,
            worker_id = %self.context_builder.worker_id(),
            "Requesting language worker restart"
        );
        self.bus.publish(HostEvent::worker_restart(
            &self.runtime,
            self.context_builder.worker_id(),
        ));
    }
}

#[derive(Debug)]
struct Shared {
    state: ProcessState,
    pid: Option<u32>,
}

struct StopRequest {
    grace: Duration,
    cancel: CancellationToken,
}

struct Monitor {
    stop_tx: oneshot::Sender<StopRequest>,
    task: JoinHandle<()>,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Supervises one worker process.
pub struct WorkerProcessSupervisor {
    worker_id: String,
    factory: Arc<dyn ProcessFactory>,
    strategy: Arc<dyn WorkerProcessStrategy>,
    config: SupervisorConfig,
    shared: Arc<Mutex<Shared>>,
    monitor: tokio::sync::Mutex<Option<Monitor>>,
}

impl WorkerProcessSupervisor {
    /// Create an idle supervisor.
    pub fn new(
        worker_id: impl Into<String>,
        factory: Arc<dyn ProcessFactory>,
        strategy: Arc<dyn WorkerProcessStrategy>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            factory,
            strategy,
            config,
            shared: Arc::new(Mutex::new(Shared {
                state: ProcessState::Idle,
                pid: None,
            })),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Worker id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.lock_shared().state
    }

    /// Pid of the running process.
    pub fn pid(&self) -> Option<u32> {
        self.lock_shared().pid
    }

    /// Whether a process is running.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_stopped(&self) {
        let mut shared = self.lock_shared();
        shared.state = ProcessState::Stopped;
        shared.pid = None;
    }

    /// Launch the worker process.
    ///
    /// Allowed from `Idle` and `Stopped`. On cancellation the supervisor
    /// ends up `Stopped` and any process launched in the meantime is killed.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut shared = self.lock_shared();
            match shared.state {
                ProcessState::Idle | ProcessState::Stopped => shared.state = ProcessState::Starting,
                other => {
                    return Err(WorkerError::InvalidState {
                        operation: "start",
                        state: other.to_string(),
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            self.set_stopped();
            return Err(WorkerError::Cancelled);
        }

        let context = self.strategy.create_launch_context();
        info!(
            worker_id = %self.worker_id,
            request_id = %context.request_id,
            executable = %context.arguments.executable_path,
            factory = self.factory.factory_type(),
            "Starting worker process"
        );

        let launched = tokio::select! {
            res = self.factory.create_process(&context) => res,
            _ = cancel.cancelled() => {
                self.set_stopped();
                return Err(WorkerError::Cancelled);
            }
        };

        let SpawnedProcess {
            mut handle,
            stdout,
            stderr,
        } = match launched {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "Failed to start worker process");
                self.set_stopped();
                return Err(e.into());
            }
        };

        if cancel.is_cancelled() {
            warn!(
                worker_id = %self.worker_id,
                pid = ?handle.pid(),
                "Start cancelled after launch, killing worker process"
            );
            if let Err(e) = kill_and_wait(handle.as_mut()).await {
                warn!(worker_id = %self.worker_id, error = %e, "Failed to kill cancelled worker process");
            }
            self.set_stopped();
            return Err(WorkerError::Cancelled);
        }

        let pid = handle.pid();
        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));
        let readers = self.spawn_output_readers(stdout, stderr, &tail);

        {
            let mut shared = self.lock_shared();
            shared.state = ProcessState::Running;
            shared.pid = pid;
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(monitor_process(MonitorContext {
            worker_id: self.worker_id.clone(),
            handle,
            stop_rx,
            shared: self.shared.clone(),
            strategy: self.strategy.clone(),
            readers,
            tail,
        }));
        *self.monitor.lock().await = Some(Monitor { stop_tx, task });

        info!(worker_id = %self.worker_id, pid = ?pid, "Worker process started");
        Ok(())
    }

    /// Stop the worker process.
    ///
    /// Allowed only from `Running`. The state moves to `Stopping` before
    /// anything else, so the exit caused by this call raises no events.
    /// The process gets `graceful_stop_timeout` to exit after SIGTERM and
    /// is killed afterwards; cancelling `cancel` kills it immediately.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut shared = self.lock_shared();
            match shared.state {
                ProcessState::Running => shared.state = ProcessState::Stopping,
                other => {
                    return Err(WorkerError::InvalidState {
                        operation: "stop",
                        state: other.to_string(),
                    });
                }
            }
        }

        info!(worker_id = %self.worker_id, pid = ?self.pid(), "Stopping worker process");

        let Some(Monitor { stop_tx, task }) = self.monitor.lock().await.take() else {
            self.set_stopped();
            return Ok(());
        };

        // Fails only if the monitor already saw the process exit.
        let _ = stop_tx.send(StopRequest {
            grace: self.config.graceful_stop_timeout,
            cancel: cancel.clone(),
        });

        if let Err(e) = task.await {
            error!(worker_id = %self.worker_id, error = %e, "Worker monitor task panicked");
            self.set_stopped();
        }

        info!(worker_id = %self.worker_id, "Worker process stopped");
        Ok(())
    }

    fn spawn_output_readers(
        &self,
        stdout: Option<OutputStream>,
        stderr: Option<OutputStream>,
        tail: &StderrTail,
    ) -> Vec<JoinHandle<()>> {
        let mut readers = Vec::with_capacity(2);

        if let Some(stream) = stdout {
            let worker_id = self.worker_id.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(worker_id = %worker_id, "{}", line);
                }
            }));
        }

        if let Some(stream) = stderr {
            let worker_id = self.worker_id.clone();
            let errors_only = self.config.stderr_errors_only;
            let capacity = self.config.stderr_tail_lines;
            let tail = tail.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log_stderr_line(&worker_id, &line, errors_only);
                    if capacity > 0 {
                        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                        if tail.len() == capacity {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            }));
        }

        readers
    }
}

impl std::fmt::Debug for WorkerProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcessSupervisor")
            .field("worker_id", &self.worker_id)
            .field("factory", &self.factory.factory_type())
            .field("shared", &*self.lock_shared())
            .finish()
    }
}

fn log_stderr_line(worker_id: &str, line: &str, errors_only: bool) {
    if line.to_ascii_lowercase().contains("warn") {
        warn!(worker_id = %worker_id, "{}", line);
    } else if errors_only {
        error!(worker_id = %worker_id, "{}", line);
    } else {
        info!(worker_id = %worker_id, "{}", line);
    }
}

async fn kill_and_wait(handle: &mut dyn ProcessHandle) -> std::io::Result<ProcessExit> {
    handle.kill().await?;
    handle.wait().await
}

async fn terminate_gracefully(
    worker_id: &str,
    handle: &mut dyn ProcessHandle,
    request: StopRequest,
) -> std::io::Result<ProcessExit> {
    if let Err(e) = handle.terminate() {
        warn!(worker_id = %worker_id, error = %e, "Failed to signal worker process");
    }

    tokio::select! {
        res = handle.wait() => return res,
        _ = tokio::time::sleep(request.grace) => {
            warn!(
                worker_id = %worker_id,
                grace_ms = request.grace.as_millis() as u64,
                "Worker process did not exit in time, killing"
            );
        }
        _ = request.cancel.cancelled() => {
            warn!(worker_id = %worker_id, "Stop cancelled, killing worker process");
        }
    }
    kill_and_wait(handle).await
}

struct MonitorContext {
    worker_id: String,
    handle: Box<dyn ProcessHandle>,
    stop_rx: oneshot::Receiver<StopRequest>,
    shared: Arc<Mutex<Shared>>,
    strategy: Arc<dyn WorkerProcessStrategy>,
    readers: Vec<JoinHandle<()>>,
    tail: StderrTail,
}

async fn monitor_process(ctx: MonitorContext) {
    let MonitorContext {
        worker_id,
        mut handle,
        stop_rx,
        shared,
        strategy,
        readers,
        tail,
    } = ctx;
    let pid = handle.pid();

    let (exit, requested) = tokio::select! {
        res = handle.wait() => (res, false),
        req = stop_rx => {
            let res = match req {
                Ok(request) => terminate_gracefully(&worker_id, handle.as_mut(), request).await,
                // Supervisor dropped without stopping.
                Err(_) => kill_and_wait(handle.as_mut()).await,
            };
            (res, true)
        }
    };

    for reader in readers {
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(worker_id = %worker_id, "Worker output reader did not drain in time");
        }
    }

    let unexpected = {
        let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let unexpected = !requested && shared.state == ProcessState::Running;
        // An unexpected exit holds `Stopping` until it has been reported.
        shared.state = if unexpected {
            ProcessState::Stopping
        } else {
            ProcessState::Stopped
        };
        shared.pid = None;
        unexpected
    };

    if !unexpected {
        debug!(worker_id = %worker_id, pid = ?pid, exit = ?exit, "Worker process exited after stop");
        return;
    }

    let mut stderr_tail = tail
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let (exit_code, signal) = match exit {
        Ok(exit) => (exit.exit_code, exit.signal),
        Err(e) => {
            if !stderr_tail.is_empty() {
                stderr_tail.push('\n');
            }
            stderr_tail.push_str(&format!("failed to wait for worker process: {e}"));
            (None, None)
        }
    };

    let error = WorkerExitError {
        pid,
        exit_code,
        signal,
        stderr_tail,
    };
    strategy.on_exit(&error);
    strategy.on_restart_needed();

    shared.lock().unwrap_or_else(PoisonError::into_inner).state = ProcessState::Stopped;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WorkerProcessArguments;
    use crate::events::EventKind;
    use crate::process::MockProcessFactory;

    struct RecordingStrategy {
        exits: Mutex<Vec<WorkerExitError>>,
        restarts: Mutex<usize>,
    }

    impl RecordingStrategy {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                exits: Mutex::new(Vec::new()),
                restarts: Mutex::new(0),
            })
        }
    }

    impl WorkerProcessStrategy for RecordingStrategy {
        fn create_launch_context(&self) -> WorkerContext {
            WorkerContextBuilder::new(
                "worker-1",
                WorkerProcessArguments {
                    executable_path: "node".to_string(),
                    ..Default::default()
                },
                "/tmp",
                "http://127.0.0.1:7071",
            )
            .build()
        }

        fn on_exit(&self, error: &WorkerExitError) {
            self.exits.lock().unwrap().push(error.clone());
        }

        fn on_restart_needed(&self) {
            *self.restarts.lock().unwrap() += 1;
        }
    }

    fn supervisor(
        factory: Arc<MockProcessFactory>,
        strategy: Arc<RecordingStrategy>,
    ) -> WorkerProcessSupervisor {
        WorkerProcessSupervisor::new(
            "worker-1",
            factory,
            strategy,
            SupervisorConfig {
                graceful_stop_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    async fn wait_for_state(sup: &WorkerProcessSupervisor, state: ProcessState) {
        for _ in 0..200 {
            if sup.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("supervisor never reached {state}, stuck in {}", sup.state());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let factory = Arc::new(MockProcessFactory::new());
        let strategy = RecordingStrategy::new();
        let sup = supervisor(factory.clone(), strategy.clone());
        let cancel = CancellationToken::new();

        assert_eq!(sup.state(), ProcessState::Idle);
        sup.start(&cancel).await.unwrap();
        assert!(sup.is_running());
        assert_eq!(sup.pid(), Some(factory.last_process().unwrap().pid()));

        sup.stop(&cancel).await.unwrap();
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert!(factory.last_process().unwrap().terminate_requested());
        assert!(strategy.exits.lock().unwrap().is_empty());
        assert_eq!(*strategy.restarts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_exit_invokes_strategy_once() {
        let factory = Arc::new(MockProcessFactory::new().with_stderr("boot\nfatal: out of memory\n"));
        let strategy = RecordingStrategy::new();
        let sup = supervisor(factory.clone(), strategy.clone());

        sup.start(&CancellationToken::new()).await.unwrap();
        let process = factory.last_process().unwrap();
        process.exit(137);
        wait_for_state(&sup, ProcessState::Stopped).await;

        let exits = strategy.exits.lock().unwrap().clone();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].pid, Some(process.pid()));
        assert_eq!(exits[0].exit_code, Some(137));
        assert!(exits[0].stderr_tail.contains("fatal: out of memory"));
        assert_eq!(*strategy.restarts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_double_start_is_invalid() {
        let factory = Arc::new(MockProcessFactory::new());
        let sup = supervisor(factory, RecordingStrategy::new());
        let cancel = CancellationToken::new();

        sup.start(&cancel).await.unwrap();
        let err = sup.start(&cancel).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidState { operation: "start", .. }));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_invalid() {
        let sup = supervisor(Arc::new(MockProcessFactory::new()), RecordingStrategy::new());
        let err = sup.stop(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidState { operation: "stop", .. }));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let factory = Arc::new(MockProcessFactory::new().ignoring_terminate());
        let sup = supervisor(factory.clone(), RecordingStrategy::new());
        let cancel = CancellationToken::new();

        sup.start(&cancel).await.unwrap();
        sup.stop(&cancel).await.unwrap();

        let process = factory.last_process().unwrap();
        assert!(process.terminate_requested());
        assert!(process.was_killed());
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_stop_kills_immediately() {
        let factory = Arc::new(MockProcessFactory::new().ignoring_terminate());
        let strategy = RecordingStrategy::new();
        let sup = WorkerProcessSupervisor::new(
            "worker-1",
            factory.clone(),
            strategy,
            SupervisorConfig {
                graceful_stop_timeout: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        sup.start(&CancellationToken::new()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        sup.stop(&cancel).await.unwrap();

        assert!(factory.last_process().unwrap().was_killed());
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_cancel_during_launch() {
        let factory = Arc::new(MockProcessFactory::new().with_spawn_delay(Duration::from_millis(50)));
        let sup = supervisor(factory.clone(), RecordingStrategy::new());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = sup.start(&cancel).await.unwrap_err();
        assert!(matches!(err, WorkerError::Cancelled));
        assert_eq!(sup.state(), ProcessState::Stopped);
        // Launch was abandoned before the factory produced a process.
        assert_eq!(factory.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_start() {
        let factory = Arc::new(MockProcessFactory::new());
        let sup = supervisor(factory.clone(), RecordingStrategy::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(sup.start(&cancel).await, Err(WorkerError::Cancelled)));
        assert_eq!(sup.state(), ProcessState::Stopped);
        assert_eq!(factory.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_stopped() {
        let factory = Arc::new(MockProcessFactory::new());
        factory.fail_launches(std::io::ErrorKind::PermissionDenied);
        let sup = supervisor(factory.clone(), RecordingStrategy::new());

        let err = sup.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::ProcessCreation(_)));
        assert_eq!(sup.state(), ProcessState::Stopped);

        factory.succeed_launches();
        sup.start(&CancellationToken::new()).await.unwrap();
        assert!(sup.is_running());
    }

    #[tokio::test]
    async fn test_rpc_strategy_publishes_error_then_restart() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s1 = seen.clone();
        let _errors = bus.subscribe(EventKind::WorkerError, move |e| {
            s1.lock().unwrap().push(e.kind());
        });
        let s2 = seen.clone();
        let _restarts = bus.subscribe(EventKind::WorkerRestart, move |e| {
            s2.lock().unwrap().push(e.kind());
        });

        let builder = WorkerContextBuilder::new(
            "worker-1",
            WorkerProcessArguments::default(),
            "/tmp",
            "http://127.0.0.1:7071",
        );
        let strategy = RpcWorkerStrategy::new("node", builder, bus);
        strategy.on_exit(&WorkerExitError {
            pid: Some(1),
            exit_code: Some(1),
            signal: None,
            stderr_tail: String::new(),
        });
        strategy.on_restart_needed();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::WorkerError, EventKind::WorkerRestart]
        );
    }
}
