// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Standby mode.
//!
//! A pre-warmed host starts in standby: it does not yet know which function
//! app it will run. Specialization ends standby exactly once.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Shared standby flag with change notification.
#[derive(Debug, Clone)]
pub struct StandbyState {
    tx: Arc<watch::Sender<bool>>,
}

impl StandbyState {
    /// Create the state. `in_standby` is the initial value.
    pub fn new(in_standby: bool) -> Self {
        let (tx, _) = watch::channel(in_standby);
        Self { tx: Arc::new(tx) }
    }

    /// Host is not in standby.
    pub fn active() -> Self {
        Self::new(false)
    }

    /// Whether the host is currently in standby.
    pub fn is_standby(&self) -> bool {
        *self.tx.borrow()
    }

    /// Leave standby. Returns `true` if this call changed the state.
    pub fn end_standby(&self) -> bool {
        let was_standby = self.tx.send_replace(false);
        if was_standby {
            info!("Host left standby mode");
        }
        was_standby
    }

    /// Receiver for standby changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once the host is not in standby.
    pub async fn wait_until_active(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|standby| !*standby).await;
    }
}

impl Default for StandbyState {
    fn default() -> Self {
        Self::active()
    }
}
