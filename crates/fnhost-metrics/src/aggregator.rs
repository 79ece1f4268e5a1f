// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function activity aggregation.
//!
//! Overlapping executions are measured as one wall-clock window: the window
//! opens when the active count goes from 0 to 1 and closes when it returns
//! to 0. Every completion counts toward the execution count.
//!
//! All state lives behind one mutex. Start, completion and drain are all
//! short critical sections, so there is no finer-grained locking.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Smallest duration a closed activity window contributes.
pub const MIN_ACTIVITY_INTERVAL: Duration = Duration::from_millis(100);

/// Cumulative counters taken by [`ActivityAggregator::drain_and_reset`].
///
/// Serializes to the wire body of a metrics report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivitySnapshot {
    /// Wall-clock milliseconds with at least one execution in flight.
    #[serde(rename = "FunctionExecutionTimeMS")]
    pub function_execution_time_ms: i64,
    /// Completed executions.
    #[serde(rename = "FunctionExecutionCount")]
    pub function_execution_count: i64,
}

impl ActivitySnapshot {
    /// Both counters are zero.
    pub fn is_empty(&self) -> bool {
        self.function_execution_time_ms == 0 && self.function_execution_count == 0
    }
}

#[derive(Debug, Default)]
struct Counters {
    active: u64,
    window_start: Option<Instant>,
    execution_time_ms: i64,
    execution_count: i64,
}

/// Thread-safe activity counters.
#[derive(Debug)]
pub struct ActivityAggregator {
    counters: Mutex<Counters>,
    min_interval: Duration,
}

impl Default for ActivityAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityAggregator {
    /// Create an aggregator using [`MIN_ACTIVITY_INTERVAL`].
    pub fn new() -> Self {
        Self::with_min_interval(MIN_ACTIVITY_INTERVAL)
    }

    /// Create an aggregator with a custom minimum window duration.
    pub fn with_min_interval(min_interval: Duration) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            min_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An execution started.
    pub fn on_function_started(&self) {
        let mut c = self.lock();
        if c.active == 0 {
            c.window_start = Some(Instant::now());
        }
        c.active += 1;
    }

    /// An execution completed.
    ///
    /// Extra completions never push the active count below zero; they still
    /// count as completed executions.
    pub fn on_function_completed(&self) {
        let mut c = self.lock();
        if c.active > 0 {
            c.active -= 1;
            if c.active == 0
                && let Some(start) = c.window_start.take()
            {
                let elapsed = start.elapsed().max(self.min_interval);
                c.execution_time_ms = c
                    .execution_time_ms
                    .saturating_add(i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
            }
        }
        c.execution_count = c.execution_count.saturating_add(1);
    }

    /// Take the cumulative counters and zero them in the same critical
    /// section. The active count is left alone.
    pub fn drain_and_reset(&self) -> ActivitySnapshot {
        let mut c = self.lock();
        let snapshot = ActivitySnapshot {
            function_execution_time_ms: c.execution_time_ms,
            function_execution_count: c.execution_count,
        };
        c.execution_time_ms = 0;
        c.execution_count = 0;
        snapshot
    }

    /// Like [`drain_and_reset`](Self::drain_and_reset) but returns `None`
    /// and leaves the counters untouched when there is nothing to report.
    pub fn drain_if_any(&self) -> Option<ActivitySnapshot> {
        let mut c = self.lock();
        if c.execution_time_ms == 0 && c.execution_count == 0 {
            return None;
        }
        let snapshot = ActivitySnapshot {
            function_execution_time_ms: c.execution_time_ms,
            function_execution_count: c.execution_count,
        };
        c.execution_time_ms = 0;
        c.execution_count = 0;
        Some(snapshot)
    }

    /// Current counters without resetting them.
    pub fn peek(&self) -> ActivitySnapshot {
        let c = self.lock();
        ActivitySnapshot {
            function_execution_time_ms: c.execution_time_ms,
            function_execution_count: c.execution_count,
        }
    }

    /// Executions currently in flight.
    pub fn active_count(&self) -> u64 {
        self.lock().active
    }

    /// No execution in flight.
    pub fn is_idle(&self) -> bool {
        self.active_count() == 0
    }
}
