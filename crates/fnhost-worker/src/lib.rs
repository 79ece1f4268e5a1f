// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost Worker - Language Worker Lifecycle
//!
//! This crate runs user functions out of process. Every supported language
//! runtime ships a worker executable; the host launches one process per
//! worker channel, watches it, and reports crashes on the host event bus so
//! that a separate owner can decide what to do about them.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐     ┌──────────────────────────┐
//! │ WorkerContextBuilder  │────►│ WorkerProcessSupervisor  │──── spawn ───► worker process
//! │ (args, env, features) │     │ (start / stop / monitor) │◄─── exit ─────┘
//! └───────────────────────┘     └────────────┬─────────────┘
//!                                            │ WorkerError / WorkerRestart
//!                                            ▼
//!                                   ┌─────────────────┐
//!                                   │    EventBus     │
//!                                   └────────┬────────┘
//!                                            │
//!                                            ▼
//!                              ┌──────────────────────────┐
//!                              │  WorkerChannelManager    │
//!                              │ (dispose / recreate with │
//!                              │  backoff + retry limit)  │
//!                              └──────────────────────────┘
//! ```
//!
//! The supervisor never restarts a process on its own. Detection of a dead
//! worker and the decision to restart it live in different components and
//! only talk through [`events::EventBus`].
//!
//! # Worker Process State Machine
//!
//! ```text
//!   ┌──────┐  start   ┌──────────┐  spawned  ┌─────────┐
//!   │ IDLE │─────────►│ STARTING │──────────►│ RUNNING │
//!   └──────┘          └────┬─────┘           └────┬────┘
//!                          │ cancelled /          │
//!                          │ spawn failed    stop │ unexpected exit
//!                          │                      ▼      (events raised)
//!                          │               ┌──────────┐        │
//!                          │               │ STOPPING │        │
//!                          │               └────┬─────┘        │
//!                          ▼                    ▼              ▼
//!                     ┌─────────────────────────────────────────────┐
//!                     │                  STOPPED                    │
//!                     └─────────────────────────────────────────────┘
//! ```
//!
//! Exit handling is only active in `RUNNING`; an exit observed while
//! `STOPPING` is the result of an intentional stop and raises nothing.
//! While an unexpected exit is being reported the state reads `STOPPING`,
//! so `STOPPED` is only observable after both events were published.
//!
//! # Modules
//!
//! - [`events`]: Host event bus and lifecycle event types
//! - [`context`]: Worker launch descriptor and its builder
//! - [`process`]: Process factory boundary (native and mock backends)
//! - [`supervisor`]: Single worker process lifecycle
//! - [`channel`]: Runtime-agnostic worker handle
//! - [`manager`]: Channel owner applying restart policy
//! - [`error`]: Error types

#![deny(missing_docs)]

/// Channel owner that reacts to worker lifecycle events.
pub mod manager;

/// Runtime-agnostic worker channel.
pub mod channel;

/// Worker launch context and builder.
pub mod context;

/// Error types for worker operations.
pub mod error;

/// Host event bus and lifecycle events.
pub mod events;

/// Process factory boundary and backends.
pub mod process;

/// Worker process supervision.
pub mod supervisor;

pub use channel::{
    ChannelConfig, ChannelState, ProcessLivenessRpc, RpcConnection, WorkerChannel, WorkerStatus,
};
pub use context::{HostingConfig, WorkerContext, WorkerContextBuilder, WorkerProcessArguments};
pub use error::{ProcessCreationError, Result, WorkerError, WorkerExitError};
pub use events::{EventBus, EventKind, HostEvent, Subscription};
pub use manager::{RestartPolicy, RpcWorkerChannelFactory, WorkerChannelFactory, WorkerChannelManager};
pub use process::{MockProcessFactory, NativeProcessFactory, ProcessFactory};
pub use supervisor::{
    ProcessState, RpcWorkerStrategy, SupervisorConfig, WorkerProcessStrategy,
    WorkerProcessSupervisor,
};
