// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cumulus-worker.

use thiserror::Error;

/// Worker errors.
///
/// Only setup failures ([`Error::Storage`], [`Error::InvalidJob`], or I/O
/// while preparing the job directory) escape
/// [`crate::engine::ExecutionEngine::run_batch`]. Everything else is caught
/// per task and recorded in the call status.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Payload store operation failed.
    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// Task unit (child process or inline task) failed.
    #[error("Unit error: {0}")]
    Unit(#[from] crate::unit::UnitError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The job payload is inconsistent.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Status event could not be delivered.
    #[error("Status reporter error: {0}")]
    Reporter(String),
}

impl Error {
    /// Stable kind name used in error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage",
            Error::Unit(_) => "unit",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::InvalidJob(_) => "invalid_job",
            Error::Reporter(_) => "reporter",
        }
    }
}

/// Result type using worker Error.
pub type Result<T> = std::result::Result<T, Error>;
