// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process module - worker process backends.
//!
//! The supervisor never touches the OS directly; it asks a
//! [`ProcessFactory`] for a process and drives it through [`ProcessHandle`].

pub mod mock;
pub mod native;
mod traits;

pub use mock::{MockProcessControl, MockProcessFactory};
pub use native::NativeProcessFactory;
pub use traits::*;
