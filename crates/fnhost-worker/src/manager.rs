// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker channel manager.
//!
//! Owns the channels of one runtime and reacts to worker lifecycle events:
//! a `WorkerError` disposes the errored channel, the `WorkerRestart` that
//! follows recreates it under the same id once the [`RestartPolicy`] allows.
//!
//! Bus handlers only enqueue a command; all channel work happens in
//! [`WorkerChannelManager::run`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ChannelConfig, ProcessLivenessRpc, WorkerChannel};
use crate::context::WorkerContextBuilder;
use crate::error::Result;
use crate::events::{EventBus, EventKind, HostEvent, Subscription};
use crate::process::ProcessFactory;
use crate::supervisor::{RpcWorkerStrategy, SupervisorConfig, WorkerProcessSupervisor};

/// When and how often crashed workers are restarted.
///
/// The delay before restart `n` within the window is
/// `first_backoff × factor^n`, capped at `max_backoff`.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Delay before the first restart.
    pub first_backoff: Duration,
    /// Upper bound for the delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive restarts.
    pub factor: f64,
    /// Restarts allowed per worker within `window`.
    pub max_restarts: usize,
    /// Sliding window for `max_restarts`.
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            first_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            factor: 2.0,
            max_restarts: 5,
            window: Duration::from_secs(600),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first_backoff.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Creates channels for the manager.
pub trait WorkerChannelFactory: Send + Sync {
    /// Runtime the channels serve.
    fn runtime(&self) -> &str;

    /// Create a stopped channel with the given id.
    fn create_channel(&self, worker_id: &str) -> WorkerChannel;
}

/// Factory for RPC language worker channels.
///
/// Each channel gets its own supervisor whose exits are reported on `bus`.
pub struct RpcWorkerChannelFactory {
    runtime: String,
    bus: EventBus,
    process_factory: Arc<dyn ProcessFactory>,
    context_template: WorkerContextBuilder,
    supervisor_config: SupervisorConfig,
    channel_config: ChannelConfig,
}

impl RpcWorkerChannelFactory {
    /// Create a factory. `context_template` supplies everything but the
    /// worker id.
    pub fn new(
        runtime: impl Into<String>,
        bus: EventBus,
        process_factory: Arc<dyn ProcessFactory>,
        context_template: WorkerContextBuilder,
    ) -> Self {
        Self {
            runtime: runtime.into(),
            bus,
            process_factory,
            context_template,
            supervisor_config: SupervisorConfig::default(),
            channel_config: ChannelConfig::default(),
        }
    }

    /// Override the supervisor configuration.
    pub fn with_supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = config;
        self
    }

    /// Override the channel configuration.
    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }
}

impl WorkerChannelFactory for RpcWorkerChannelFactory {
    fn runtime(&self) -> &str {
        &self.runtime
    }

    fn create_channel(&self, worker_id: &str) -> WorkerChannel {
        let strategy = Arc::new(RpcWorkerStrategy::new(
            &self.runtime,
            self.context_template.for_worker(worker_id),
            self.bus.clone(),
        ));
        let supervisor = WorkerProcessSupervisor::new(
            worker_id,
            self.process_factory.clone(),
            strategy,
            self.supervisor_config.clone(),
        );
        WorkerChannel::new(
            &self.runtime,
            supervisor,
            Box::new(ProcessLivenessRpc),
            self.channel_config.clone(),
        )
    }
}

#[derive(Debug)]
enum Command {
    Dispose(String),
    Restart(String),
}

/// Owns the channels of one runtime and restarts crashed workers.
pub struct WorkerChannelManager {
    runtime: String,
    factory: Arc<dyn WorkerChannelFactory>,
    policy: RestartPolicy,
    channels: Mutex<HashMap<String, Arc<WorkerChannel>>>,
    restart_history: StdMutex<HashMap<String, VecDeque<Instant>>>,
    disposed: StdMutex<HashSet<String>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown: CancellationToken,
    _subscriptions: Vec<Subscription>,
}

impl WorkerChannelManager {
    /// Create a manager and subscribe it to worker events on `bus`.
    pub fn new(factory: Arc<dyn WorkerChannelFactory>, bus: &EventBus, policy: RestartPolicy) -> Self {
        let runtime = factory.runtime().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let errors = {
            let tx = commands_tx.clone();
            let runtime = runtime.clone();
            bus.subscribe(EventKind::WorkerError, move |event| {
                if let HostEvent::WorkerError {
                    runtime: rt,
                    worker_id,
                    ..
                } = event
                    && *rt == runtime
                {
                    let _ = tx.send(Command::Dispose(worker_id.clone()));
                }
            })
        };
        let restarts = {
            let tx = commands_tx.clone();
            let runtime = runtime.clone();
            bus.subscribe(EventKind::WorkerRestart, move |event| {
                if let HostEvent::WorkerRestart {
                    runtime: rt,
                    worker_id,
                    ..
                } = event
                    && *rt == runtime
                {
                    let _ = tx.send(Command::Restart(worker_id.clone()));
                }
            })
        };

        Self {
            runtime,
            factory,
            policy,
            channels: Mutex::new(HashMap::new()),
            restart_history: StdMutex::new(HashMap::new()),
            disposed: StdMutex::new(HashSet::new()),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
            shutdown: CancellationToken::new(),
            _subscriptions: vec![errors, restarts],
        }
    }

    /// Runtime managed by this instance.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Token that stops [`run`](Self::run) and aborts pending restarts.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Create and start a new channel.
    pub async fn start_channel(&self, cancel: &CancellationToken) -> Result<Arc<WorkerChannel>> {
        let worker_id = format!("{}-{}", self.runtime, Uuid::new_v4().simple());
        let channel = Arc::new(self.factory.create_channel(&worker_id));
        channel.start_process(cancel).await?;
        self.channels
            .lock()
            .await
            .insert(worker_id, channel.clone());
        Ok(channel)
    }

    /// Channel by id.
    pub async fn channel(&self, worker_id: &str) -> Option<Arc<WorkerChannel>> {
        self.channels.lock().await.get(worker_id).cloned()
    }

    /// Ids of all owned channels.
    pub async fn channel_ids(&self) -> Vec<String> {
        self.channels.lock().await.keys().cloned().collect()
    }

    /// Stop and forget one channel. Stopping raises no events, so the
    /// channel is not restarted.
    pub async fn stop_channel(&self, worker_id: &str, cancel: &CancellationToken) -> Result<()> {
        let channel = self.channels.lock().await.remove(worker_id);
        match channel {
            Some(channel) => channel.stop_process(cancel).await,
            None => Ok(()),
        }
    }

    /// Stop every owned channel.
    pub async fn stop_all(&self, cancel: &CancellationToken) {
        let channels: Vec<_> = self.channels.lock().await.drain().collect();
        for (worker_id, channel) in channels {
            if let Err(e) = channel.stop_process(cancel).await {
                warn!(worker_id = %worker_id, error = %e, "Failed to stop worker channel");
            }
        }
    }

    /// Process worker events until shutdown.
    pub async fn run(&self) {
        let Some(mut commands) = self.commands_rx.lock().await.take() else {
            warn!(runtime = %self.runtime, "Worker channel manager is already running");
            return;
        };

        info!(
            runtime = %self.runtime,
            max_restarts = self.policy.max_restarts,
            window_secs = self.policy.window.as_secs(),
            "Worker channel manager started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(runtime = %self.runtime, "Worker channel manager received shutdown signal");
                    break;
                }

                command = commands.recv() => {
                    let Some(command) = command else { break };
                    debug!(runtime = %self.runtime, command = ?command, "Handling worker event");
                    match command {
                        Command::Dispose(worker_id) => self.dispose(&worker_id).await,
                        Command::Restart(worker_id) => self.restart(&worker_id).await,
                    }
                }
            }
        }

        info!(runtime = %self.runtime, "Worker channel manager stopped");
    }

    async fn dispose(&self, worker_id: &str) {
        let channel = self.channels.lock().await.remove(worker_id);
        let Some(channel) = channel else {
            debug!(worker_id = %worker_id, "Errored worker channel is not owned here");
            return;
        };
        info!(worker_id = %worker_id, "Disposing errored worker channel");
        self.mark_disposed(worker_id);
        if let Err(e) = channel.stop_process(&self.shutdown).await {
            debug!(worker_id = %worker_id, error = %e, "Errored worker channel was not running");
        }
    }

    fn mark_disposed(&self, worker_id: &str) {
        self.disposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id.to_string());
    }

    /// Consume the disposal record of `worker_id`; `false` if this manager
    /// did not dispose it.
    fn take_disposed(&self, worker_id: &str) -> bool {
        self.disposed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(worker_id)
    }

    /// Record a restart attempt; `None` when the limit is reached.
    fn next_attempt(&self, worker_id: &str) -> Option<u32> {
        let mut history = self
            .restart_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let attempts = history.entry(worker_id.to_string()).or_default();

        let now = Instant::now();
        while let Some(&oldest) = attempts.front() {
            if now.duration_since(oldest) > self.policy.window {
                attempts.pop_front();
            } else {
                break;
            }
        }

        if attempts.len() >= self.policy.max_restarts {
            return None;
        }
        let attempt = attempts.len() as u32;
        attempts.push_back(now);
        Some(attempt)
    }

    async fn restart(&self, worker_id: &str) {
        if !self.take_disposed(worker_id) {
            debug!(worker_id = %worker_id, "Restart requested for a worker not disposed here, ignoring");
            return;
        }

        let Some(attempt) = self.next_attempt(worker_id) else {
            error!(
                runtime = %self.runtime,
                worker_id = %worker_id,
                max_restarts = self.policy.max_restarts,
                window_secs = self.policy.window.as_secs(),
                "Worker exceeded restart limit, leaving it stopped"
            );
            return;
        };

        let delay = self.policy.backoff(attempt);
        info!(
            worker_id = %worker_id,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Restarting worker channel"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => return,
        }

        let channel = Arc::new(self.factory.create_channel(worker_id));
        match channel.start_process(&self.shutdown).await {
            Ok(()) => {
                self.channels
                    .lock()
                    .await
                    .insert(worker_id.to_string(), channel);
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Failed to restart worker channel");
                if !self.shutdown.is_cancelled() {
                    self.mark_disposed(worker_id);
                    let _ = self.commands_tx.send(Command::Restart(worker_id.to_string()));
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkerChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannelManager")
            .field("runtime", &self.runtime)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RestartPolicy {
            first_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            factor: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_constant_backoff() {
        let policy = RestartPolicy {
            first_backoff: Duration::from_millis(250),
            factor: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), policy.backoff(7));
    }
}
