// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost - Functions Host
//!
//! Supervises one language worker runtime and publishes function activity
//! metrics to the control plane.

use tracing::{info, warn};

use fnhost_server::config::HostConfig;
use fnhost_server::runtime::{HostRuntime, HostRuntimeBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fnhost_server=info,fnhost_worker=info,fnhost_metrics=info".into()
            }),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = HostConfig::from_env()?;

    info!(
        runtime = %config.worker_runtime,
        executable = %config.worker.executable_path,
        script_root = %config.script_root.display(),
        rpc_server_uri = %config.rpc_server_uri,
        standby = config.standby,
        "Starting fnhost"
    );

    let runtime = HostRuntimeBuilder::from_config(&config)?
        .build()?
        .start()
        .await?;

    info!("fnhost ready");

    wait_for_shutdown(&runtime).await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("fnhost shut down");

    Ok(())
}

/// Wait for Ctrl-C, ending standby on every `SIGUSR1` meanwhile.
#[cfg(unix)]
async fn wait_for_shutdown(runtime: &HostRuntime) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut specialize = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => return Ok(res?),
            Some(()) = specialize.recv() => {
                if !runtime.specialize() {
                    info!("Specialization requested but host is not in standby");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_runtime: &HostRuntime) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
