// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cumulus-compute.

use thiserror::Error;

/// Errors raised by a compute backend.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote side answered with an unexpected status.
    #[error("Unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The service or runtime does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote side answered with something that is not understood.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// A wait for a remote condition ran out of time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// An external command failed.
    #[error("Command `{command}` failed with status {status:?}")]
    Command {
        /// Command line that was run.
        command: String,
        /// Exit code, if the command exited normally.
        status: Option<i32>,
    },

    /// The backend configuration is unusable.
    #[error("Invalid backend configuration: {0}")]
    Config(String),

    /// Scripted failure (mock backend).
    #[error("{0}")]
    Scripted(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether the error means the remote object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            BackendError::NotFound(_) => true,
            BackendError::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// Errors from the dispatch layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ComputeError {
    /// The compute configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No backend is registered under the configured name.
    #[error("Unknown compute backend: {0}")]
    UnknownBackend(String),

    /// The backend could not be constructed.
    #[error("An error was produced trying to create the '{name}' compute backend: {source}")]
    BackendInit {
        /// Backend name.
        name: String,
        /// Underlying error.
        #[source]
        source: BackendError,
    },

    /// A delegated backend operation failed.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, ComputeError>;
