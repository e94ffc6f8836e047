// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in compute backends.

pub mod http_service;
pub mod mock;

pub use http_service::{HttpServiceBackend, HttpServiceConfig};
pub use mock::{MockBackend, MockOutcome};
