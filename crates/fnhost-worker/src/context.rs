// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker launch context.
//!
//! A [`WorkerContext`] is the immutable descriptor handed to the process
//! factory for one process start. It is built fresh by
//! [`WorkerContextBuilder::build`] every time a worker is launched so that
//! hosting-config feature flags changed at runtime reach the next process.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use uuid::Uuid;

/// Environment variable carrying the worker directory into the worker.
pub const WORKER_DIRECTORY_SETTING: &str = "FUNCTIONS_WORKER_DIRECTORY";

/// Default maximum RPC message size in bytes.
pub const DEFAULT_MAX_MESSAGE_LENGTH_BYTES: usize = i32::MAX as usize;

/// Executable and arguments used to launch a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerProcessArguments {
    /// Worker executable (e.g. `node`, `python3`, `java`).
    pub executable_path: String,
    /// Arguments passed to the executable before the worker path.
    pub executable_arguments: Vec<String>,
    /// Worker entry point (script or jar), if the runtime needs one.
    pub worker_path: Option<String>,
    /// Arguments passed after the worker path.
    pub worker_arguments: Vec<String>,
}

/// Hosting-config feature flags.
///
/// Shared and updatable at runtime; every process start reads the flags
/// that are active at that moment.
#[derive(Debug, Clone, Default)]
pub struct HostingConfig {
    features: Arc<RwLock<BTreeMap<String, String>>>,
}

impl HostingConfig {
    /// Create an empty feature set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` pairs separated by commas.
    ///
    /// Entries without `=` or with an empty key are ignored.
    pub fn parse(features: &str) -> Self {
        let config = Self::new();
        for pair in features.split(',') {
            if let Some((key, value)) = pair.split_once('=') {
                let key = key.trim();
                if !key.is_empty() {
                    config.set_feature(key, value.trim());
                }
            }
        }
        config
    }

    /// Set or replace a feature flag.
    pub fn set_feature(&self, key: impl Into<String>, value: impl Into<String>) {
        self.features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Remove a feature flag.
    pub fn remove_feature(&self, key: &str) {
        self.features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Snapshot of the currently active flags.
    pub fn features(&self) -> BTreeMap<String, String> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Immutable launch descriptor for one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerContext {
    /// Fresh identifier for this launch.
    pub request_id: String,
    /// Maximum RPC message size the worker should accept.
    pub max_message_length: usize,
    /// Worker id.
    pub worker_id: String,
    /// Executable and arguments.
    pub arguments: WorkerProcessArguments,
    /// Function app root; used as the working directory.
    pub script_root_path: PathBuf,
    /// URI the worker dials back to.
    pub server_uri: String,
    /// Environment variables applied on top of the host environment.
    pub environment: HashMap<String, String>,
}

impl WorkerContext {
    /// Full argument list passed to the executable.
    pub fn command_line_args(&self) -> Vec<String> {
        let mut args = self.arguments.executable_arguments.clone();
        if let Some(ref worker_path) = self.arguments.worker_path {
            args.push(worker_path.clone());
        }
        args.extend(self.arguments.worker_arguments.iter().cloned());
        args.extend([
            "--functions-uri".to_string(),
            self.server_uri.clone(),
            "--functions-worker-id".to_string(),
            self.worker_id.clone(),
            "--functions-request-id".to_string(),
            self.request_id.clone(),
            "--functions-grpc-max-message-length".to_string(),
            self.max_message_length.to_string(),
        ]);
        args
    }
}

/// Assembles a [`WorkerContext`] per process start.
#[derive(Debug, Clone)]
pub struct WorkerContextBuilder {
    worker_id: String,
    arguments: WorkerProcessArguments,
    script_root_path: PathBuf,
    server_uri: String,
    worker_directory: String,
    hosting_config: HostingConfig,
    max_message_length: usize,
}

impl WorkerContextBuilder {
    /// Create a builder for `worker_id`.
    pub fn new(
        worker_id: impl Into<String>,
        arguments: WorkerProcessArguments,
        script_root_path: impl Into<PathBuf>,
        server_uri: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            arguments,
            script_root_path: script_root_path.into(),
            server_uri: server_uri.into(),
            worker_directory: String::new(),
            hosting_config: HostingConfig::new(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH_BYTES,
        }
    }

    /// Set the worker directory exported as [`WORKER_DIRECTORY_SETTING`].
    pub fn worker_directory(mut self, dir: impl Into<String>) -> Self {
        self.worker_directory = dir.into();
        self
    }

    /// Set the feature flag source.
    pub fn hosting_config(mut self, config: HostingConfig) -> Self {
        self.hosting_config = config;
        self
    }

    /// Override the maximum RPC message size.
    pub fn max_message_length(mut self, bytes: usize) -> Self {
        self.max_message_length = bytes;
        self
    }

    /// Same launch settings for a different worker id.
    pub fn for_worker(&self, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..self.clone()
        }
    }

    /// Worker id this builder produces contexts for.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Executable and arguments.
    pub fn arguments(&self) -> &WorkerProcessArguments {
        &self.arguments
    }

    /// Build a fresh context.
    ///
    /// Environment is merged in a fixed order: the worker directory first,
    /// then every active feature flag. A flag reusing the directory key wins.
    pub fn build(&self) -> WorkerContext {
        let mut environment = HashMap::new();
        environment.insert(
            WORKER_DIRECTORY_SETTING.to_string(),
            self.worker_directory.clone(),
        );
        for (key, value) in self.hosting_config.features() {
            environment.insert(key, value);
        }

        WorkerContext {
            request_id: Uuid::new_v4().to_string(),
            max_message_length: self.max_message_length,
            worker_id: self.worker_id.clone(),
            arguments: self.arguments.clone(),
            script_root_path: self.script_root_path.clone(),
            server_uri: self.server_uri.clone(),
            environment,
        }
    }
}
