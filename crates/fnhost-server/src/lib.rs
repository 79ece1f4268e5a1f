// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost Server - Functions Host Runtime
//!
//! Runs one language worker runtime and reports function activity to the
//! control plane.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!                 │               HostRuntime                │
//!                 │                                          │
//!  dispatcher ───►│  EventBus ──► WorkerChannelManager       │
//!  (Function*     │     │              │ start / restart     │
//!   events)       │     │              ▼                     │
//!                 │     │         WorkerChannel ─► worker    │
//!                 │     ▼                          process   │
//!                 │  MetricsPublisher ─► ActivityAggregator  │
//!                 └─────────┬────────────────────────────────┘
//!                           │ POST /operations/metrics
//!                           ▼
//!                     control plane
//! ```
//!
//! # Signals
//!
//! | Signal | Effect |
//! |--------|--------|
//! | `SIGUSR1` | end standby (specialize) |
//! | `SIGINT` | graceful shutdown |
//!
//! # Configuration
//!
//! See [`config::HostConfig`] for the environment variables.

#![deny(missing_docs)]

/// Host configuration from environment variables.
pub mod config;

/// Embeddable host runtime.
pub mod runtime;

pub use config::{ConfigError, HostConfig, MetricsSettings};
pub use runtime::{HostRuntime, HostRuntimeBuilder, HostRuntimeConfig};
