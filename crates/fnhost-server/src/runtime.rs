// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable host runtime.
//!
//! [`HostRuntime`] wires the event bus, the worker channel manager, the
//! activity aggregator and the metrics publisher together. It can be
//! embedded into an existing tokio application instead of running the
//! `fnhost` binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fnhost_server::runtime::HostRuntime;
//!
//! let runtime = HostRuntime::builder()
//!     .bus(bus)
//!     .channel_factory(Arc::new(factory))
//!     .transport(Arc::new(transport))
//!     .build()?
//!     .start()
//!     .await?;
//!
//! runtime.bus().publish(HostEvent::function_started("HttpTrigger", "inv-1"));
//!
//! runtime.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fnhost_metrics::{
    ActivityAggregator, FunctionActivitySink, HttpMetricsTransport, MetricsPublisher,
    MetricsTransport, PublisherConfig, PublisherEnvironment, StandbyState,
};
use fnhost_worker::{
    EventBus, EventKind, HostEvent, HostingConfig, NativeProcessFactory, RestartPolicy,
    RpcWorkerChannelFactory, Subscription, SupervisorConfig, WorkerChannelFactory,
    WorkerChannelManager, WorkerContextBuilder,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::HostConfig;

type EnvironmentSource = Arc<dyn Fn() -> PublisherEnvironment + Send + Sync>;

/// Builder for creating a [`HostRuntime`].
pub struct HostRuntimeBuilder {
    bus: Option<EventBus>,
    channel_factory: Option<Arc<dyn WorkerChannelFactory>>,
    restart_policy: RestartPolicy,
    transport: Option<Arc<dyn MetricsTransport>>,
    publisher_config: PublisherConfig,
    environment_source: Option<EnvironmentSource>,
    standby: StandbyState,
    worker_count: usize,
}

impl Default for HostRuntimeBuilder {
    fn default() -> Self {
        Self {
            bus: None,
            channel_factory: None,
            restart_policy: RestartPolicy::default(),
            transport: None,
            publisher_config: PublisherConfig::default(),
            environment_source: None,
            standby: StandbyState::active(),
            worker_count: 1,
        }
    }
}

impl HostRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder for the native worker described by `config`.
    ///
    /// The metrics publisher is enabled only when `config` carries metrics
    /// settings; it posts to the configured host name and reads the rest of
    /// its identity from the environment.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        let bus = EventBus::new();

        let template = WorkerContextBuilder::new(
            format!("{}-template", config.worker_runtime),
            config.worker.clone(),
            config.script_root.clone(),
            config.rpc_server_uri.clone(),
        )
        .worker_directory(config.worker_directory.clone())
        .hosting_config(HostingConfig::parse(&config.hosting_features));

        let factory = RpcWorkerChannelFactory::new(
            config.worker_runtime.clone(),
            bus.clone(),
            Arc::new(NativeProcessFactory::new()),
            template,
        )
        .with_supervisor_config(SupervisorConfig {
            stderr_errors_only: config.stderr_errors_only,
            ..Default::default()
        });

        let mut builder = Self::new()
            .bus(bus)
            .channel_factory(Arc::new(factory))
            .standby(StandbyState::new(config.standby));

        match &config.metrics {
            Some(metrics) => {
                let transport =
                    HttpMetricsTransport::new(metrics.signing_key.clone(), Duration::from_secs(30))?;
                let hostname = metrics.hostname.clone();
                builder = builder
                    .transport(Arc::new(transport))
                    .publisher_environment(move || PublisherEnvironment {
                        hostname: hostname.clone(),
                        ..PublisherEnvironment::from_env()
                    });
            }
            None => warn!(
                "FNHOST_METRICS_HOSTNAME or FNHOST_AUTH_SIGNING_KEY not set, metrics publisher disabled"
            ),
        }

        Ok(builder)
    }

    /// Set the event bus. Default: a fresh bus.
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the channel factory (required).
    pub fn channel_factory(mut self, factory: Arc<dyn WorkerChannelFactory>) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    /// Set the restart policy for crashed workers.
    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    /// Set the metrics transport. Without one no publisher runs.
    pub fn transport(mut self, transport: Arc<dyn MetricsTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the publisher timing.
    ///
    /// Default: first tick after 2 seconds, then every 5 seconds
    pub fn publisher_config(mut self, config: PublisherConfig) -> Self {
        self.publisher_config = config;
        self
    }

    /// Set where the publisher reads its identity from.
    ///
    /// Default: [`PublisherEnvironment::from_env`]
    pub fn publisher_environment<F>(mut self, source: F) -> Self
    where
        F: Fn() -> PublisherEnvironment + Send + Sync + 'static,
    {
        let source: EnvironmentSource = Arc::new(source);
        self.environment_source = Some(source);
        self
    }

    /// Set the standby state shared with the publisher.
    pub fn standby(mut self, standby: StandbyState) -> Self {
        self.standby = standby;
        self
    }

    /// Number of worker channels started with the runtime.
    ///
    /// Default: 1
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HostRuntimeConfig> {
        let channel_factory = self
            .channel_factory
            .ok_or_else(|| anyhow::anyhow!("channel_factory is required"))?;

        Ok(HostRuntimeConfig {
            bus: self.bus.unwrap_or_default(),
            channel_factory,
            restart_policy: self.restart_policy,
            transport: self.transport,
            publisher_config: self.publisher_config,
            environment_source: self
                .environment_source
                .unwrap_or_else(|| Arc::new(PublisherEnvironment::from_env) as EnvironmentSource),
            standby: self.standby,
            worker_count: self.worker_count,
        })
    }
}

/// Configuration for a [`HostRuntime`].
pub struct HostRuntimeConfig {
    bus: EventBus,
    channel_factory: Arc<dyn WorkerChannelFactory>,
    restart_policy: RestartPolicy,
    transport: Option<Arc<dyn MetricsTransport>>,
    publisher_config: PublisherConfig,
    environment_source: EnvironmentSource,
    standby: StandbyState,
    worker_count: usize,
}

impl HostRuntimeConfig {
    /// Start the runtime: the manager loop, the publisher, and the initial
    /// worker channels.
    pub async fn start(self) -> Result<HostRuntime> {
        let runtime_name = self.channel_factory.runtime().to_string();
        let aggregator = Arc::new(ActivityAggregator::new());

        let manager = Arc::new(WorkerChannelManager::new(
            self.channel_factory,
            &self.bus,
            self.restart_policy,
        ));
        let manager_handle = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run().await })
        };

        let publisher = self.transport.map(|transport| {
            let source = self.environment_source.clone();
            MetricsPublisher::with_environment(
                aggregator.clone(),
                transport,
                self.publisher_config.clone(),
                self.standby.clone(),
                move || source(),
            )
        });

        let activity = match &publisher {
            Some(publisher) => forward_activity(&self.bus, Arc::new(publisher.clone())),
            None => Vec::new(),
        };

        let runtime = HostRuntime {
            bus: self.bus,
            manager,
            manager_handle,
            aggregator,
            publisher,
            standby: self.standby,
            _activity: activity,
        };

        let cancel = CancellationToken::new();
        for _ in 0..self.worker_count {
            if let Err(e) = runtime.manager.start_channel(&cancel).await {
                error!(runtime = %runtime_name, error = %e, "Failed to start worker channel");
                runtime.shutdown().await?;
                return Err(e.into());
            }
        }

        info!(
            runtime = %runtime_name,
            workers = self.worker_count,
            metrics = runtime.publisher.is_some(),
            standby = runtime.standby.is_standby(),
            "HostRuntime started"
        );

        Ok(runtime)
    }
}

/// Route function activity events from `bus` into `sink`.
pub fn forward_activity(bus: &EventBus, sink: Arc<dyn FunctionActivitySink>) -> Vec<Subscription> {
    let started = {
        let sink = sink.clone();
        bus.subscribe(EventKind::FunctionStarted, move |event| {
            if let HostEvent::FunctionStarted {
                function_name,
                invocation_id,
            } = event
            {
                sink.on_function_started(function_name, invocation_id);
            }
        })
    };
    let completed = bus.subscribe(EventKind::FunctionCompleted, move |event| {
        if let HostEvent::FunctionCompleted {
            function_name,
            invocation_id,
        } = event
        {
            sink.on_function_completed(function_name, invocation_id);
        }
    });
    vec![started, completed]
}

/// A running functions host that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct HostRuntime {
    bus: EventBus,
    manager: Arc<WorkerChannelManager>,
    manager_handle: JoinHandle<()>,
    aggregator: Arc<ActivityAggregator>,
    publisher: Option<MetricsPublisher>,
    standby: StandbyState,
    _activity: Vec<Subscription>,
}

impl HostRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HostRuntimeBuilder {
        HostRuntimeBuilder::new()
    }

    /// Host event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Worker channel manager.
    pub fn manager(&self) -> &Arc<WorkerChannelManager> {
        &self.manager
    }

    /// Activity counters fed by the bus.
    pub fn aggregator(&self) -> &Arc<ActivityAggregator> {
        &self.aggregator
    }

    /// Metrics publisher, if a transport was configured.
    pub fn publisher(&self) -> Option<&MetricsPublisher> {
        self.publisher.as_ref()
    }

    /// Standby state.
    pub fn standby(&self) -> &StandbyState {
        &self.standby
    }

    /// End standby. Returns `true` if the host was in standby.
    pub fn specialize(&self) -> bool {
        let ended = self.standby.end_standby();
        if ended {
            info!("Host specialized");
        }
        ended
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the publisher timer, stops every worker channel, then stops the
    /// manager loop and waits for it.
    pub async fn shutdown(self) -> Result<()> {
        info!("HostRuntime shutting down...");

        if let Some(publisher) = &self.publisher {
            publisher.shutdown().await;
        }

        // Intentional stops raise no restart events.
        self.manager.stop_all(&CancellationToken::new()).await;
        self.manager.shutdown_handle().cancel();

        if let Err(e) = self.manager_handle.await {
            error!("Worker channel manager task panicked: {}", e);
            return Err(e.into());
        }

        info!("HostRuntime shutdown complete");
        Ok(())
    }
}
