// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host event bus.
//!
//! [`EventBus`] is a synchronous publish/subscribe courier for lifecycle
//! events. Producers (the process supervisor, the invocation dispatcher)
//! publish; consumers (channel owners, the metrics publisher) subscribe per
//! [`EventKind`].
//!
//! ## Rules
//! - **Synchronous delivery**: `publish()` calls every current subscriber of
//!   the event's kind on the publishing task, in subscription order.
//! - **Panic isolation**: a panicking handler is logged and skipped; the
//!   remaining subscribers still receive the event and the publisher never
//!   sees the panic.
//! - **No retention**: events with no subscribers are dropped. Nothing is
//!   queued or retried.
//! - **Explicit lifetime**: the bus keeps only weak references. A
//!   subscription lives exactly as long as its [`Subscription`] handle.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::error::WorkerExitError;

/// Event variants carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A worker process died unexpectedly.
    WorkerError,
    /// A worker process needs to be restarted.
    WorkerRestart,
    /// A function invocation started.
    FunctionStarted,
    /// A function invocation completed.
    FunctionCompleted,
}

/// Lifecycle events published on the host bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    /// Worker process terminated outside of an intentional stop.
    WorkerError {
        /// Worker runtime (e.g. "node").
        runtime: String,
        /// Worker id.
        worker_id: String,
        /// Exit diagnostics.
        cause: WorkerExitError,
        /// When the exit was observed.
        at: DateTime<Utc>,
    },
    /// Worker process exited and needs to be restarted.
    WorkerRestart {
        /// Worker runtime.
        runtime: String,
        /// Worker id.
        worker_id: String,
        /// When the restart was requested.
        at: DateTime<Utc>,
    },
    /// Function invocation started.
    FunctionStarted {
        /// Function name.
        function_name: String,
        /// Invocation id.
        invocation_id: String,
    },
    /// Function invocation completed.
    FunctionCompleted {
        /// Function name.
        function_name: String,
        /// Invocation id.
        invocation_id: String,
    },
}

impl HostEvent {
    /// Build a worker error event stamped with the current time.
    pub fn worker_error(
        runtime: impl Into<String>,
        worker_id: impl Into<String>,
        cause: WorkerExitError,
    ) -> Self {
        Self::WorkerError {
            runtime: runtime.into(),
            worker_id: worker_id.into(),
            cause,
            at: Utc::now(),
        }
    }

    /// Build a worker restart event stamped with the current time.
    pub fn worker_restart(runtime: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self::WorkerRestart {
            runtime: runtime.into(),
            worker_id: worker_id.into(),
            at: Utc::now(),
        }
    }

    /// Build a function started event.
    pub fn function_started(
        function_name: impl Into<String>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self::FunctionStarted {
            function_name: function_name.into(),
            invocation_id: invocation_id.into(),
        }
    }

    /// Build a function completed event.
    pub fn function_completed(
        function_name: impl Into<String>,
        invocation_id: impl Into<String>,
    ) -> Self {
        Self::FunctionCompleted {
            function_name: function_name.into(),
            invocation_id: invocation_id.into(),
        }
    }

    /// Variant tag used for subscription routing.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkerError { .. } => EventKind::WorkerError,
            Self::WorkerRestart { .. } => EventKind::WorkerRestart,
            Self::FunctionStarted { .. } => EventKind::FunctionStarted,
            Self::FunctionCompleted { .. } => EventKind::FunctionCompleted,
        }
    }
}

type Handler = dyn Fn(&HostEvent) + Send + Sync;

struct Entry {
    id: u64,
    handler: Weak<Handler>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, kind: EventKind, id: u64) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entries) = subscribers.get_mut(&kind) {
            entries.retain(|e| e.id != id);
        }
    }
}

/// Process-wide publish/subscribe hub for [`HostEvent`]s.
///
/// Cheap to clone; all clones share the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&HostEvent) + Send + Sync + 'static,
    {
        let handler: Arc<Handler> = Arc::new(handler);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Entry {
                id,
                handler: Arc::downgrade(&handler),
            });

        Subscription {
            id,
            kind,
            handler: Some(handler),
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every current subscriber of its kind.
    ///
    /// Returns the number of handlers that ran to completion.
    pub fn publish(&self, event: HostEvent) -> usize {
        let kind = event.kind();

        // Snapshot live handlers so they run without holding the lock; a
        // handler may subscribe or unsubscribe while being called.
        let handlers: Vec<Arc<Handler>> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match subscribers.get(&kind) {
                Some(entries) => entries.iter().filter_map(|e| e.handler.upgrade()).collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            debug!(kind = ?kind, "No subscribers, dropping event");
            return 0;
        }

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(kind = ?kind, reason = %reason, "Event subscriber panicked");
                }
            }
        }
        delivered
    }

    /// Number of live subscribers for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|entries| entries.iter().filter(|e| e.handler.strong_count() > 0).count())
            .unwrap_or(0)
    }
}

/// Handle that keeps a bus registration alive.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    handler: Option<Arc<Handler>>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Event kind this subscription receives.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the registration now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.handler.take().is_some()
            && let Some(bus) = self.bus.upgrade()
        {
            bus.remove(self.kind, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
