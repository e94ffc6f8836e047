// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cumulus Compute - Dispatch Layer
//!
//! The client side of cumulus hands task payloads to a compute platform
//! through this crate. [`Compute`] binds one configured [`ComputeBackend`]
//! and adds bounded invocation retry on top of it; every runtime lifecycle
//! operation is passed through unchanged.
//!
//! # Architecture
//!
//! ```text
//!   Compute::shared(config) ──► ComputeCache ──► BackendRegistry
//!          │                     (one per key)     (name → constructor)
//!          ▼
//! ┌──────────────────────┐      ┌────────────────────────┐
//! │       Compute        │─────►│ dyn ComputeBackend     │
//! │ invoke: retry + sleep│      │ http_service │ mock    │
//! └──────────────────────┘      └────────────────────────┘
//! ```
//!
//! # Retry Policy
//!
//! | Setting | Default | Meaning |
//! |---------|---------|---------|
//! | `invocation_retry` | `true` | Retry invocations without a handle |
//! | `retries` | `5` | Maximum attempts, the first one included |
//! | `retry_sleeps` | `[1, 5, 10, 20, 30]` | Seconds, one picked at random per retry |
//!
//! A backend error during `invoke` is logged and treated like a missing
//! handle. When every attempt fails, `invoke` returns `None`.
//!
//! # Example
//!
//! ```no_run
//! use cumulus_compute::{Compute, ComputeConfig, InvokePayload};
//! use serde_json::json;
//!
//! # async fn example() -> cumulus_compute::Result<()> {
//! let config = ComputeConfig::new("http_service")
//!     .with_section(json!({"api_url": "http://127.0.0.1:8001/apis/v1"}));
//! let compute = Compute::shared(&config)?;
//!
//! let payload = InvokePayload::new("exec", "A000", "00001");
//! if compute.invoke("cumulus/runtime:0.3", 256, &payload).await.is_none() {
//!     eprintln!("task was not accepted");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

/// Compute backend contract and shared payload types.
pub mod backend;

/// Built-in backends.
pub mod backends;

/// Retried dispatch and the instance cache.
pub mod compute;

/// Dispatch configuration.
pub mod config;

/// Error types.
pub mod error;

/// Backend selection by name.
pub mod registry;

pub use backend::{
    BackendResult, ComputeBackend, InvocationHandle, InvokePayload, RuntimeInfo, RuntimeMeta,
};
pub use compute::{Compute, ComputeCache};
pub use config::ComputeConfig;
pub use error::{BackendError, ComputeError, Result};
pub use registry::BackendRegistry;
