// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost Metrics - Activity Reporting for Autoscaling
//!
//! The scale controller decides how many hosts a function app gets from
//! two numbers each host reports: how much wall-clock time it spent
//! executing functions and how many executions completed. This crate
//! counts both and ships them to the control plane.
//!
//! # Architecture
//!
//! ```text
//!  invocation dispatcher
//!     │ on_function_started / on_function_completed
//!     ▼
//! ┌──────────────────────┐   drain_and_reset   ┌────────────────────┐
//! │  ActivityAggregator  │◄────────────────────│  MetricsPublisher  │
//! │ (one mutex, counters │                     │ (timer: 2s, then   │
//! │  + active window)    │                     │  every 5s)         │
//! └──────────────────────┘                     └─────────┬──────────┘
//!                                                        │ ActivitySnapshot
//!                                                        ▼
//!                                            ┌────────────────────────┐
//!                                            │ HttpMetricsTransport   │
//!                                            │ POST /operations/      │
//!                                            │ metrics + site token   │
//!                                            └────────────────────────┘
//! ```
//!
//! # Publisher State Machine
//!
//! ```text
//!   ┌───────────────┐  standby   ┌─────────┐  standby ended  ┌────────┐
//!   │ UNINITIALIZED │───────────►│ STANDBY │────────────────►│ ACTIVE │
//!   └───────┬───────┘            └─────────┘                 └────────┘
//!           │              not in standby                        ▲
//!           └────────────────────────────────────────────────────┘
//! ```
//!
//! Activity reported before the publisher is `ACTIVE` is dropped.
//!
//! # Modules
//!
//! - [`aggregator`]: Concurrent activity counters
//! - [`publisher`]: Timer-driven publication
//! - [`transport`]: HTTP delivery of reports
//! - [`token`]: Signed short-lived site token
//! - [`tls`]: Certificate trust policy
//! - [`standby`]: Standby mode state
//! - [`error`]: Error types

#![deny(missing_docs)]

/// Concurrent function activity counters.
pub mod aggregator;

/// Error types for metrics publication.
pub mod error;

/// Timer-driven metrics publisher.
pub mod publisher;

/// Standby mode state and change notification.
pub mod standby;

/// Certificate trust policy for the metrics endpoint.
pub mod tls;

/// Signed site token.
pub mod token;

/// Report delivery.
pub mod transport;

pub use aggregator::{ActivityAggregator, ActivitySnapshot, MIN_ACTIVITY_INTERVAL};
pub use error::{CertificateValidationError, MetricsError, PublicationError, Result, TokenError};
pub use publisher::{
    FunctionActivitySink, MetricsPublisher, PublisherConfig, PublisherEnvironment, PublisherState,
    MIN_PUBLISH_INTERVAL,
};
pub use standby::StandbyState;
pub use token::SiteToken;
pub use transport::{HttpMetricsTransport, MetricsTransport};
