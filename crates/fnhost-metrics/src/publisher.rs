// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timer-driven metrics publisher.
//!
//! The publisher drains the [`ActivityAggregator`] on a fixed schedule and
//! hands every non-empty report to a [`MetricsTransport`]. While the host is
//! in standby nothing is counted and no timer runs.
//!
//! Publication happens on its own task so a slow endpoint never delays the
//! timer. A tick that fires while the previous report is still in flight is
//! skipped; the activity it would have reported stays in the aggregator and
//! goes out with the next tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{ActivityAggregator, ActivitySnapshot};
use crate::standby::StandbyState;
use crate::transport::MetricsTransport;

/// Shortest period the timer runs at; a zero interval is raised to this.
pub const MIN_PUBLISH_INTERVAL: Duration = Duration::from_millis(1);

/// Publisher timing.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Delay from start to the first tick.
    pub initial_delay: Duration,
    /// Period between ticks.
    pub interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            interval: Duration::from_secs(5),
        }
    }
}

/// Host identity captured when the publisher initializes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherEnvironment {
    /// Control-plane host name.
    pub hostname: String,
    /// Container name.
    pub container_name: Option<String>,
    /// Home stamp name.
    pub stamp_name: Option<String>,
    /// Stamp deployment id, lower-cased.
    pub tenant: Option<String>,
    /// Use plain `http` instead of `https`.
    pub skip_ssl_validation: bool,
    /// Host process id.
    pub process_id: u32,
}

impl PublisherEnvironment {
    /// Read the environment of the current process.
    ///
    /// - `FNHOST_METRICS_HOSTNAME`
    /// - `CONTAINER_NAME`
    /// - `WEBSITE_HOME_STAMPNAME`
    /// - `WEBSITE_STAMP_DEPLOYMENT_ID`
    /// - `FNHOST_SKIP_SSL_VALIDATION` (`"1"` selects `http`)
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            hostname: var("FNHOST_METRICS_HOSTNAME").unwrap_or_default(),
            container_name: var("CONTAINER_NAME"),
            stamp_name: var("WEBSITE_HOME_STAMPNAME"),
            tenant: var("WEBSITE_STAMP_DEPLOYMENT_ID").map(|t| t.to_lowercase()),
            skip_ssl_validation: var("FNHOST_SKIP_SSL_VALIDATION").as_deref() == Some("1"),
            process_id: std::process::id(),
        }
    }
}

/// Lifecycle of a [`MetricsPublisher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// Constructed, neither waiting nor publishing.
    Uninitialized,
    /// Waiting for the host to leave standby.
    Standby,
    /// Counting and publishing.
    Active,
}

/// Receiver of function activity notifications.
///
/// Notifications are fire-and-forget and never fail.
pub trait FunctionActivitySink: Send + Sync {
    /// An invocation started.
    fn on_function_started(&self, function_name: &str, invocation_id: &str);

    /// An invocation completed.
    fn on_function_completed(&self, function_name: &str, invocation_id: &str);
}

type EnvironmentSource = Arc<dyn Fn() -> PublisherEnvironment + Send + Sync>;

struct Inner {
    aggregator: Arc<ActivityAggregator>,
    transport: Arc<dyn MetricsTransport>,
    config: PublisherConfig,
    environment_source: EnvironmentSource,
    environment: RwLock<Option<Arc<PublisherEnvironment>>>,
    state: Mutex<PublisherState>,
    initialized: AtomicBool,
    started: AtomicBool,
    publish_in_flight: Arc<AtomicBool>,
    ticks: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Publishes aggregated function activity on a timer.
///
/// Cheap to clone; clones share the same timer and counters.
#[derive(Clone)]
pub struct MetricsPublisher {
    inner: Arc<Inner>,
}

impl MetricsPublisher {
    /// Create a publisher reading its environment with
    /// [`PublisherEnvironment::from_env`].
    ///
    /// Starts immediately unless `standby` reports standby, in which case
    /// it starts the first time standby ends. Must be called inside a tokio
    /// runtime.
    pub fn new(
        aggregator: Arc<ActivityAggregator>,
        transport: Arc<dyn MetricsTransport>,
        config: PublisherConfig,
        standby: StandbyState,
    ) -> Self {
        Self::with_environment(
            aggregator,
            transport,
            config,
            standby,
            PublisherEnvironment::from_env,
        )
    }

    /// Like [`new`](Self::new) with a custom environment source. The source
    /// is read once, when the publisher initializes.
    pub fn with_environment<F>(
        aggregator: Arc<ActivityAggregator>,
        transport: Arc<dyn MetricsTransport>,
        config: PublisherConfig,
        standby: StandbyState,
        environment_source: F,
    ) -> Self
    where
        F: Fn() -> PublisherEnvironment + Send + Sync + 'static,
    {
        let publisher = Self {
            inner: Arc::new(Inner {
                aggregator,
                transport,
                config,
                environment_source: Arc::new(environment_source),
                environment: RwLock::new(None),
                state: Mutex::new(PublisherState::Uninitialized),
                initialized: AtomicBool::new(false),
                started: AtomicBool::new(false),
                publish_in_flight: Arc::new(AtomicBool::new(false)),
                ticks: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        if standby.is_standby() {
            publisher.set_state(PublisherState::Standby);
            info!("Host in standby mode, metrics publisher waiting for specialization");
            let waiting = publisher.clone();
            let handle = tokio::spawn(async move {
                tokio::select! {
                    _ = waiting.inner.shutdown.cancelled() => {}
                    _ = standby.wait_until_active() => waiting.start(),
                }
            });
            publisher.track(handle);
        } else {
            publisher.start();
        }

        publisher
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PublisherState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether activity is being counted.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Number of timer ticks so far.
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Relaxed)
    }

    /// Identity captured at initialization.
    pub fn environment(&self) -> Option<Arc<PublisherEnvironment>> {
        self.inner
            .environment
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_state(&self, state: PublisherState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Capture the host identity and begin counting activity.
    pub fn initialize(&self) {
        let environment = Arc::new((self.inner.environment_source)());
        info!(
            container = environment.container_name.as_deref().unwrap_or(""),
            stamp = environment.stamp_name.as_deref().unwrap_or(""),
            tenant = environment.tenant.as_deref().unwrap_or(""),
            process_id = environment.process_id,
            "Initializing metrics publisher"
        );
        *self
            .inner
            .environment
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(environment);
        self.inner.initialized.store(true, Ordering::Release);
    }

    /// Initialize and arm the timer. Only the first call has an effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("Metrics publisher already started");
            return;
        }
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        if self.inner.config.interval.is_zero() {
            warn!(
                interval_ms = MIN_PUBLISH_INTERVAL.as_millis() as u64,
                "Metrics publish interval is zero, using the minimum"
            );
        }

        self.initialize();
        self.set_state(PublisherState::Active);

        let publisher = self.clone();
        let handle = tokio::spawn(async move { publisher.run_timer().await });
        self.track(handle);

        info!(
            container = self
                .environment()
                .and_then(|e| e.container_name.clone())
                .unwrap_or_default(),
            initial_delay_ms = self.inner.config.initial_delay.as_millis() as u64,
            interval_ms = self.inner.config.interval.as_millis() as u64,
            "Starting metrics publisher"
        );
    }

    async fn run_timer(&self) {
        let config = &self.inner.config;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + config.initial_delay,
            config.interval.max(MIN_PUBLISH_INTERVAL),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.inner.shutdown.cancelled() => {
                    debug!("Metrics publisher timer stopped");
                    break;
                }

                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    /// Handle one timer tick: drain and publish if there is activity.
    fn on_tick(&self) {
        let tick = self.inner.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        if self
            .inner
            .publish_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(tick, "Previous metrics publish still in flight, skipping tick");
            return;
        }

        let Some(report) = self.inner.aggregator.drain_if_any() else {
            self.inner.publish_in_flight.store(false, Ordering::Release);
            return;
        };

        let Some(environment) = self.environment() else {
            // Unreachable after start(); keep the activity for later.
            warn!(tick, "Metrics publisher ticked before initialization");
            self.inner.publish_in_flight.store(false, Ordering::Release);
            return;
        };

        let transport = self.inner.transport.clone();
        let in_flight = InFlight(self.inner.publish_in_flight.clone());
        let handle = tokio::spawn(async move {
            let _in_flight = in_flight;
            publish_report(transport.as_ref(), &report, &environment, tick).await;
        });
        self.track(handle);
    }

    /// Stop the timer and wait for background work, including a publish in
    /// flight, to finish.
    pub async fn shutdown(&self) {
        info!("Stopping metrics publisher");
        self.inner.shutdown.cancel();

        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Metrics publisher task panicked");
            }
        }
    }
}

/// Clears the in-flight flag when the publish task ends, even by panic.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn publish_report(
    transport: &dyn MetricsTransport,
    report: &ActivitySnapshot,
    environment: &PublisherEnvironment,
    tick: u64,
) {
    match transport.publish(report, environment).await {
        Ok(()) => debug!(
            tick,
            execution_count = report.function_execution_count,
            execution_time_ms = report.function_execution_time_ms,
            "Published function activity"
        ),
        Err(e) => warn!(
            tick,
            error = %e,
            execution_count = report.function_execution_count,
            "Metrics publish failed, report dropped"
        ),
    }
}

impl FunctionActivitySink for MetricsPublisher {
    fn on_function_started(&self, _function_name: &str, _invocation_id: &str) {
        if self.is_initialized() {
            self.inner.aggregator.on_function_started();
        }
    }

    fn on_function_completed(&self, _function_name: &str, _invocation_id: &str) {
        if self.is_initialized() {
            self.inner.aggregator.on_function_completed();
        }
    }
}

impl std::fmt::Debug for MetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsPublisher")
            .field("state", &self.state())
            .field("ticks", &self.ticks())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublicationError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingTransport {
        reports: Mutex<Vec<ActivitySnapshot>>,
        delay: Duration,
    }

    #[async_trait]
    impl MetricsTransport for RecordingTransport {
        async fn publish(
            &self,
            report: &ActivitySnapshot,
            _environment: &PublisherEnvironment,
        ) -> Result<(), PublicationError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reports.lock().unwrap().push(*report);
            Ok(())
        }
    }

    fn test_environment() -> PublisherEnvironment {
        PublisherEnvironment {
            hostname: "metrics.test".to_string(),
            container_name: Some("container-1".to_string()),
            tenant: Some("tenant-a".to_string()),
            ..Default::default()
        }
    }

    fn publisher(
        transport: Arc<RecordingTransport>,
        standby: StandbyState,
    ) -> (MetricsPublisher, Arc<ActivityAggregator>) {
        let aggregator = Arc::new(ActivityAggregator::new());
        let publisher = MetricsPublisher::with_environment(
            aggregator.clone(),
            transport,
            PublisherConfig::default(),
            standby,
            test_environment,
        );
        (publisher, aggregator)
    }

    fn one_execution(publisher: &MetricsPublisher) {
        publisher.on_function_started("HttpTrigger", "inv-1");
        publisher.on_function_completed("HttpTrigger", "inv-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_publisher_first_tick_after_initial_delay() {
        let transport = Arc::new(RecordingTransport::default());
        let (publisher, _) = publisher(transport.clone(), StandbyState::active());

        assert_eq!(publisher.state(), PublisherState::Active);
        assert_eq!(
            publisher.environment().unwrap().tenant.as_deref(),
            Some("tenant-a")
        );
        one_execution(&publisher);

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(publisher.ticks(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(publisher.ticks(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reports = transport.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].function_execution_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ticks_publish_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let (publisher, _) = publisher(transport.clone(), StandbyState::active());

        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(publisher.ticks(), 3);
        assert!(transport.reports.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_never_starts_without_notification() {
        let transport = Arc::new(RecordingTransport::default());
        let (publisher, aggregator) = publisher(transport.clone(), StandbyState::new(true));

        assert_eq!(publisher.state(), PublisherState::Standby);
        one_execution(&publisher);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(publisher.ticks(), 0);
        assert!(!publisher.is_initialized());
        // Activity before initialization is dropped.
        assert!(aggregator.peek().is_empty());
        assert!(transport.reports.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leaving_standby_starts_exactly_one_timer() {
        let transport = Arc::new(RecordingTransport::default());
        let standby = StandbyState::new(true);
        let (publisher, _) = publisher(transport.clone(), standby.clone());

        standby.end_standby();
        standby.end_standby();
        tokio::task::yield_now().await;
        publisher.start();

        assert_eq!(publisher.state(), PublisherState::Active);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(publisher.ticks(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(publisher.ticks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_while_publish_in_flight() {
        let transport = Arc::new(RecordingTransport {
            delay: Duration::from_secs(7),
            ..Default::default()
        });
        let (publisher, aggregator) = publisher(transport.clone(), StandbyState::active());

        one_execution(&publisher);
        // First tick at 2s starts a publish that lasts until 9s.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        one_execution(&publisher);

        // Tick at 7s is skipped, activity stays in the aggregator.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(publisher.ticks(), 2);
        assert_eq!(aggregator.peek().function_execution_count, 1);

        // Tick at 12s publishes it; its publish completes at 19s.
        tokio::time::sleep(Duration::from_secs(13)).await;
        let reports = transport.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].function_execution_count, 1);
    }

    /// Panics on its first publish, records afterwards.
    #[derive(Default)]
    struct PanicOnceTransport {
        panicked: AtomicBool,
        reports: Mutex<Vec<ActivitySnapshot>>,
    }

    #[async_trait]
    impl MetricsTransport for PanicOnceTransport {
        async fn publish(
            &self,
            report: &ActivitySnapshot,
            _environment: &PublisherEnvironment,
        ) -> Result<(), PublicationError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("transport exploded");
            }
            self.reports.lock().unwrap().push(*report);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_publish_does_not_block_later_ticks() {
        let transport = Arc::new(PanicOnceTransport::default());
        let aggregator = Arc::new(ActivityAggregator::new());
        let publisher = MetricsPublisher::with_environment(
            aggregator,
            transport.clone(),
            PublisherConfig::default(),
            StandbyState::active(),
            test_environment,
        );

        one_execution(&publisher);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(transport.panicked.load(Ordering::SeqCst));
        assert!(!publisher.inner.publish_in_flight.load(Ordering::Acquire));

        one_execution(&publisher);
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reports = transport.reports.lock().unwrap().clone();
        assert_eq!(publisher.ticks(), 2);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].function_execution_count, 1);

        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_runs_at_minimum() {
        let transport = Arc::new(RecordingTransport::default());
        let publisher = MetricsPublisher::with_environment(
            Arc::new(ActivityAggregator::new()),
            transport.clone(),
            PublisherConfig {
                initial_delay: Duration::ZERO,
                interval: Duration::ZERO,
            },
            StandbyState::active(),
            test_environment,
        );

        one_execution(&publisher);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(publisher.state(), PublisherState::Active);
        assert!(publisher.ticks() >= 2);
        assert_eq!(transport.reports.lock().unwrap().len(), 1);

        publisher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_timer() {
        let transport = Arc::new(RecordingTransport::default());
        let (publisher, _) = publisher(transport, StandbyState::active());

        publisher.shutdown().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(publisher.ticks(), 0);
    }
}
