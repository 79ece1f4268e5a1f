// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery of metrics reports to the control plane.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::ActivitySnapshot;
use crate::error::{MetricsError, PublicationError, TokenError};
use crate::publisher::PublisherEnvironment;
use crate::tls;
use crate::token::SiteToken;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-fnhost-request-id";

/// Header carrying the signed site token.
pub const SITE_TOKEN_HEADER: &str = "x-fnhost-site-token";

/// User agent sent with every report.
pub const USER_AGENT: &str = concat!("fnhost/", env!("CARGO_PKG_VERSION"));

/// Path of the metrics endpoint.
pub const METRICS_PATH: &str = "/operations/metrics";

/// Validity of the site token attached to a report.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Sends a report somewhere.
#[async_trait]
pub trait MetricsTransport: Send + Sync {
    /// Deliver `report` using the identity captured in `environment`.
    async fn publish(
        &self,
        report: &ActivitySnapshot,
        environment: &PublisherEnvironment,
    ) -> Result<(), PublicationError>;
}

/// HTTP transport: `POST {scheme}://{hostname}/operations/metrics`.
///
/// The client is built once and reused for every report.
pub struct HttpMetricsTransport {
    client: reqwest::Client,
    signing_key: Vec<u8>,
}

impl HttpMetricsTransport {
    /// Transport trusting the Mozilla roots through the metrics trust policy.
    ///
    /// Fails with [`TokenError::EmptyKey`] if `signing_key` is empty.
    pub fn new(signing_key: Vec<u8>, request_timeout: Duration) -> Result<Self, MetricsError> {
        if signing_key.is_empty() {
            return Err(TokenError::EmptyKey.into());
        }
        let tls = tls::client_config(tls::default_root_store())?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self::with_client(client, signing_key))
    }

    /// Transport over a caller-provided client.
    pub fn with_client(client: reqwest::Client, signing_key: Vec<u8>) -> Self {
        Self {
            client,
            signing_key,
        }
    }

    /// Endpoint URL for `environment`.
    pub fn endpoint(environment: &PublisherEnvironment) -> String {
        let scheme = if environment.skip_ssl_validation {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}{METRICS_PATH}", environment.hostname)
    }
}

#[async_trait]
impl MetricsTransport for HttpMetricsTransport {
    async fn publish(
        &self,
        report: &ActivitySnapshot,
        environment: &PublisherEnvironment,
    ) -> Result<(), PublicationError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(TOKEN_LIFETIME).unwrap_or(chrono::Duration::minutes(5));
        let token = SiteToken::create(expires_at, &self.signing_key)?;
        let body = serde_json::to_string(report)?;
        let url = Self::endpoint(environment);
        let request_id = Uuid::new_v4().to_string();

        debug!(
            request_id = %request_id,
            url = %url,
            content = %body,
            "Making metrics publish request"
        );

        let response = self
            .client
            .post(&url)
            .header(REQUEST_ID_HEADER, &request_id)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(SITE_TOKEN_HEADER, token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| PublicationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(request_id = %request_id, "Metrics publish call succeeded");
            Ok(())
        } else {
            Err(PublicationError::Status {
                status: status.as_u16(),
            })
        }
    }
}
