// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the fnhost binary.

use std::path::PathBuf;

use base64::{Engine as _, engine::general_purpose};
use fnhost_worker::WorkerProcessArguments;

/// Control-plane publication settings. Present only when both the host name
/// and the signing key are configured.
#[derive(Clone)]
pub struct MetricsSettings {
    /// Control-plane host name.
    pub hostname: String,
    /// Decoded HMAC key for the site token.
    pub signing_key: Vec<u8>,
}

impl std::fmt::Debug for MetricsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsSettings")
            .field("hostname", &self.hostname)
            .field("signing_key", &"<redacted>")
            .finish()
    }
}

/// Host configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Runtime name of the language worker (e.g. `node`).
    pub worker_runtime: String,
    /// Executable and arguments used to launch the worker.
    pub worker: WorkerProcessArguments,
    /// Worker directory exported to the worker process.
    pub worker_directory: String,
    /// Treat every stderr line of the worker as an error.
    pub stderr_errors_only: bool,
    /// Function app root, the worker's working directory.
    pub script_root: PathBuf,
    /// URI the worker dials back to.
    pub rpc_server_uri: String,
    /// Hosting-config feature flags as `key=value,key=value`.
    pub hosting_features: String,
    /// Metrics publication; `None` disables the publisher.
    pub metrics: Option<MetricsSettings>,
    /// Start in standby (placeholder mode).
    pub standby: bool,
}

impl HostConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let words = |name: &str| -> Vec<String> {
            var(name)
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default()
        };

        let worker_runtime =
            var("FNHOST_WORKER_RUNTIME").ok_or(ConfigError::MissingEnvVar("FNHOST_WORKER_RUNTIME"))?;
        let executable_path = var("FNHOST_WORKER_EXECUTABLE")
            .ok_or(ConfigError::MissingEnvVar("FNHOST_WORKER_EXECUTABLE"))?;

        let worker = WorkerProcessArguments {
            executable_path,
            executable_arguments: words("FNHOST_WORKER_ARGUMENTS"),
            worker_path: var("FNHOST_WORKER_PATH"),
            worker_arguments: Vec::new(),
        };

        let stderr_errors_only = match var("FNHOST_WORKER_STDERR_ERRORS_ONLY") {
            Some(value) => parse_bool("FNHOST_WORKER_STDERR_ERRORS_ONLY", &value)?,
            None => false,
        };

        let metrics = match (var("FNHOST_METRICS_HOSTNAME"), var("FNHOST_AUTH_SIGNING_KEY")) {
            (Some(hostname), Some(key)) => {
                let signing_key = general_purpose::STANDARD
                    .decode(key.trim())
                    .map_err(ConfigError::InvalidSigningKey)?;
                if signing_key.is_empty() {
                    return Err(ConfigError::EmptySigningKey);
                }
                Some(MetricsSettings {
                    hostname,
                    signing_key,
                })
            }
            _ => None,
        };

        Ok(Self {
            worker_runtime,
            worker,
            worker_directory: var("FNHOST_WORKER_DIRECTORY").unwrap_or_else(|| ".".to_string()),
            stderr_errors_only,
            script_root: PathBuf::from(var("FNHOST_SCRIPT_ROOT").unwrap_or_else(|| ".".to_string())),
            rpc_server_uri: var("FNHOST_RPC_SERVER_URI")
                .unwrap_or_else(|| "http://127.0.0.1:7071".to_string()),
            hosting_features: var("FNHOST_HOSTING_FEATURES").unwrap_or_default(),
            metrics,
            standby: var("WEBSITE_PLACEHOLDER_MODE").as_deref() == Some("1"),
        })
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A flag is neither true nor false.
    #[error("Invalid boolean for {name}: {value}")]
    InvalidBool {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// The signing key is not valid base64.
    #[error("FNHOST_AUTH_SIGNING_KEY is not valid base64: {0}")]
    InvalidSigningKey(base64::DecodeError),
    /// The signing key decodes to nothing.
    #[error("FNHOST_AUTH_SIGNING_KEY is empty")]
    EmptySigningKey,
}
