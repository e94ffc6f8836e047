// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cumulus Worker - Task Execution Engine
//!
//! This crate runs on the compute side of cumulus. A compute backend
//! delivers a job payload (a batch of call ids sharing one function), and
//! the engine runs every task in an isolated task unit with a hard
//! wall-clock timeout, captures its logs, and reports a call status record
//! for each task even when the unit crashes.
//!
//! # Architecture
//!
//! ```text
//!     job payload (HTTP or CLI)
//!              │
//!              ▼
//! ┌───────────────────────────┐      ┌──────────────────┐
//! │     ExecutionEngine       │─────►│   ObjectStore    │  func + data
//! │  run_batch → worker pool  │      └──────────────────┘
//! └─────────────┬─────────────┘
//!               │ one task at a time per worker
//!               ▼
//! ┌───────────────────────────┐      ┌──────────────────┐
//! │ TaskUnit (process/inline) │      │CallStatusReporter│ init / finish
//! │  stats file + done FIFO   │      └──────────────────┘
//! └───────────────────────────┘
//! ```
//!
//! # Task Outcomes
//!
//! | Condition | `failure` |
//! |-----------|-----------|
//! | Unit outlives `execution_timeout` | `timeout` |
//! | Unit exits without writing `done` | `out_of_memory` |
//! | Engine fails while supervising | `internal_error` |
//!
//! None of these are retried. Completed tasks carry the fields from their
//! stats file (`result`, `exception`, `function_exec_time`, ...).
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CUMULUS_HTTP_PORT` | No | `8080` | Port of the `serve` entrypoint |
//! | `CUMULUS_WORK_DIR` | No | `/tmp/cumulus` | Job and task directories |
//! | `CUMULUS_STORAGE_DIR` | No | `.data` | Local payload store root |
//! | `CUMULUS_STATUS_PREFIX` | No | `jobs` | Key prefix for status records |
//! | `CUMULUS_UNIT_KIND` | No | `process` on Unix | `process` or `inline` |
//! | `CUMULUS_RUNNER_PROGRAM` | For `process` | - | Job runner executable |
//! | `CUMULUS_RUNNER_ARGS` | No | - | Comma-separated leading arguments |
//! | `CUMULUS_KILL_GRACE_MS` | No | `2000` | SIGTERM to SIGKILL delay |
//! | `CUMULUS_KEEP_TASK_DIRS` | No | `true` | Keep task directories |
//! | `CUMULUS_PREINSTALLS` | No | - | Packages reported by `/preinstalls` |

#![deny(missing_docs)]

/// Job runner side of the task protocol.
pub mod child;

/// Worker configuration loaded from environment variables.
pub mod config;

/// Batch execution and per-task supervision.
pub mod engine;

/// Serializable error envelope.
pub mod envelope;

/// Error types for worker operations.
pub mod error;

/// Job payload and task types.
pub mod job;

/// HTTP entrypoint.
pub mod server;

/// Stats file reading and writing.
pub mod stats;

/// Call status records and reporters.
pub mod status;

/// Payload store interface and backends.
pub mod storage;

/// Per-task execution logs.
pub mod tasklog;

/// Task units (process or inline).
pub mod unit;

pub use engine::{BatchReport, EngineConfig, ExecutionEngine};
pub use error::{Error, Result};
pub use job::{Job, Task};
pub use status::{CallStatus, CallStatusReporter, FailureKind, StatusEvent};
