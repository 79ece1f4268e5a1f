// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker channel.
//!
//! A [`WorkerChannel`] is the handle the rest of the host uses for one
//! worker: it has a stable id, answers status probes, and starts and stops
//! the underlying process. The RPC transport is represented only by its
//! lifecycle hooks ([`RpcConnection`]).

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};
use crate::supervisor::WorkerProcessSupervisor;

/// Configuration for a [`WorkerChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Upper bound for a status probe.
    pub status_timeout: Duration,
    /// Upper bound for the RPC connection to become ready after launch.
    pub startup_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            status_timeout: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    /// Constructed, never started.
    Created,
    /// Process launch or RPC handshake in progress.
    Starting,
    /// Process running and RPC ready.
    Running,
    /// Stop in progress.
    Stopping,
    /// Stopped; may be started again.
    Stopped,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Result of a successful status probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    /// Channel id.
    pub worker_id: String,
    /// Channel state at probe time.
    pub state: ChannelState,
    /// Process id.
    pub pid: Option<u32>,
    /// Round trip of the probe in milliseconds.
    pub latency_ms: u64,
}

/// Lifecycle hooks of the RPC connection to a worker.
///
/// Message framing is not part of this trait; only the points where the
/// channel has to wait for, probe or close the connection.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// Wait until the freshly launched worker is ready for requests.
    async fn wait_ready(&self, process: &WorkerProcessSupervisor) -> Result<()>;

    /// Probe the worker.
    async fn status(&self, process: &WorkerProcessSupervisor) -> Result<()>;

    /// Close the connection before the process is stopped.
    async fn close(&self, process: &WorkerProcessSupervisor) -> Result<()>;
}

/// Connection that answers from the process state alone.
///
/// Ready and healthy as long as the supervised process is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLivenessRpc;

#[async_trait]
impl RpcConnection for ProcessLivenessRpc {
    async fn wait_ready(&self, process: &WorkerProcessSupervisor) -> Result<()> {
        self.status(process).await
    }

    async fn status(&self, process: &WorkerProcessSupervisor) -> Result<()> {
        if process.is_running() {
            Ok(())
        } else {
            Err(WorkerError::Rpc(format!(
                "worker process is {}",
                process.state()
            )))
        }
    }

    async fn close(&self, _process: &WorkerProcessSupervisor) -> Result<()> {
        Ok(())
    }
}

/// Handle to one language worker.
pub struct WorkerChannel {
    id: String,
    runtime: String,
    supervisor: WorkerProcessSupervisor,
    rpc: Box<dyn RpcConnection>,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
}

impl WorkerChannel {
    /// Create a channel around `supervisor`. The channel id is the
    /// supervisor's worker id.
    pub fn new(
        runtime: impl Into<String>,
        supervisor: WorkerProcessSupervisor,
        rpc: Box<dyn RpcConnection>,
        config: ChannelConfig,
    ) -> Self {
        Self {
            id: supervisor.worker_id().to_string(),
            runtime: runtime.into(),
            supervisor,
            rpc,
            config,
            state: Mutex::new(ChannelState::Created),
        }
    }

    /// Stable channel id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runtime this channel serves.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        *self.lock_state()
    }

    /// Pid of the worker process.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Whether the channel is running and its process is alive.
    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running && self.supervisor.is_running()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        *self.lock_state() = state;
    }

    fn transition(
        &self,
        operation: &'static str,
        allowed: &[ChannelState],
        next: ChannelState,
    ) -> Result<()> {
        let mut state = self.lock_state();
        if !allowed.contains(&*state) {
            return Err(WorkerError::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        *state = next;
        Ok(())
    }

    /// Probe the worker.
    ///
    /// Fails with [`WorkerError::ChannelUnresponsive`] if the probe does not
    /// complete within `status_timeout`.
    pub async fn get_status(&self) -> Result<WorkerStatus> {
        let started = Instant::now();
        match tokio::time::timeout(self.config.status_timeout, self.rpc.status(&self.supervisor))
            .await
        {
            Err(_) => {
                warn!(worker_id = %self.id, "Worker status probe timed out");
                Err(WorkerError::ChannelUnresponsive {
                    worker_id: self.id.clone(),
                    timeout: self.config.status_timeout,
                })
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(WorkerStatus {
                worker_id: self.id.clone(),
                state: self.state(),
                pid: self.supervisor.pid(),
                latency_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Start the worker process and wait for its RPC connection.
    ///
    /// Allowed from `Created` and `Stopped`. Any failure, including
    /// cancellation, leaves the channel `Stopped` with no process running.
    pub async fn start_process(&self, cancel: &CancellationToken) -> Result<()> {
        self.transition(
            "start",
            &[ChannelState::Created, ChannelState::Stopped],
            ChannelState::Starting,
        )?;

        if let Err(e) = self.supervisor.start(cancel).await {
            self.set_state(ChannelState::Stopped);
            return Err(e);
        }

        let ready = tokio::select! {
            res = tokio::time::timeout(self.config.startup_timeout, self.rpc.wait_ready(&self.supervisor)) => {
                match res {
                    Ok(res) => res,
                    Err(_) => Err(WorkerError::Rpc(format!(
                        "worker did not become ready within {}ms",
                        self.config.startup_timeout.as_millis()
                    ))),
                }
            }
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
        };

        if let Err(e) = ready {
            warn!(worker_id = %self.id, error = %e, "Worker failed to become ready, stopping process");
            // A cancelled token makes the stop kill without a grace period.
            let stop_token = if cancel.is_cancelled() {
                cancel.clone()
            } else {
                CancellationToken::new()
            };
            if let Err(stop_err) = self.supervisor.stop(&stop_token).await {
                debug!(worker_id = %self.id, error = %stop_err, "Worker process already gone");
            }
            self.set_state(ChannelState::Stopped);
            return Err(e);
        }

        self.set_state(ChannelState::Running);
        info!(worker_id = %self.id, runtime = %self.runtime, pid = ?self.pid(), "Worker channel started");
        Ok(())
    }

    /// Close the RPC connection and stop the worker process.
    ///
    /// Allowed only from `Running`. A process that has already died is
    /// treated as stopped.
    pub async fn stop_process(&self, cancel: &CancellationToken) -> Result<()> {
        self.transition("stop", &[ChannelState::Running], ChannelState::Stopping)?;

        if let Err(e) = self.rpc.close(&self.supervisor).await {
            warn!(worker_id = %self.id, error = %e, "Failed to close worker RPC connection");
        }

        match self.supervisor.stop(cancel).await {
            Ok(()) => {}
            Err(WorkerError::InvalidState { state, .. }) => {
                debug!(worker_id = %self.id, process_state = %state, "Worker process was not running");
            }
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to stop worker process");
            }
        }

        self.set_state(ChannelState::Stopped);
        info!(worker_id = %self.id, runtime = %self.runtime, "Worker channel stopped");
        Ok(())
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("runtime", &self.runtime)
            .field("state", &self.state())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}
