// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fnhost-metrics.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Site token could not be created or validated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// Signing key is empty.
    #[error("Site token signing key is empty")]
    EmptyKey,

    /// Token does not have the `payload.signature` shape.
    #[error("Malformed site token")]
    Malformed,

    /// Signature does not match the payload.
    #[error("Site token signature mismatch")]
    BadSignature,

    /// Token is past its expiry.
    #[error("Site token expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Server certificate rejected by the trust policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CertificateValidationError {
    /// The chain does not lead to a trusted root.
    #[error("Certificate chain validation failed: {status}")]
    Chain {
        /// Chain status reported by the validator.
        status: String,
    },

    /// Only the host name mismatched, but the chain could not be rebuilt.
    #[error("Certificate name mismatch and chain rebuild failed: {status}")]
    RebuildFailed {
        /// Chain status of the rebuild.
        status: String,
    },

    /// The presented certificate could not be parsed.
    #[error("Invalid server certificate: {0}")]
    Unparseable(String),
}

/// Metrics report could not be delivered.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublicationError {
    /// Endpoint answered with a non-2xx status.
    #[error("Metrics publish call failed (status={status})")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// Request did not complete.
    #[error("Metrics publish request failed: {0}")]
    Transport(String),

    /// Report could not be serialized.
    #[error("Failed to serialize metrics report: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Site token could not be created.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// Errors setting up the metrics transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// Site token failure.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// TLS configuration failed.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type using [`MetricsError`].
pub type Result<T> = std::result::Result<T, MetricsError>;
