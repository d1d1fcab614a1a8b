// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dock module - container operations on the fleet's Docker hosts.

pub mod http;
pub mod mock;
mod traits;

pub use http::HttpDock;
pub use mock::MockDock;
pub use traits::*;
