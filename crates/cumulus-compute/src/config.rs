// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch layer configuration.
//!
//! ```json
//! {
//!     "backend": "http_service",
//!     "invocation_retry": true,
//!     "retries": 5,
//!     "retry_sleeps": [1, 5, 10, 20, 30],
//!     "http_service": { "api_url": "http://127.0.0.1:8001/apis/v1" }
//! }
//! ```
//!
//! Every key other than the retry settings is a backend section; the one
//! named by `backend` is handed to that backend's constructor.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ComputeError, Result};

fn default_invocation_retry() -> bool {
    true
}

fn default_retries() -> u32 {
    5
}

fn default_retry_sleeps() -> Vec<u64> {
    vec![1, 5, 10, 20, 30]
}

/// Configuration of a [`crate::Compute`] instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Name of the backend to use
    pub backend: String,
    /// Retry invocations that produced no handle
    #[serde(default = "default_invocation_retry")]
    pub invocation_retry: bool,
    /// Maximum number of invocation attempts
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Candidate backoff sleeps in seconds, one picked at random per retry
    #[serde(default = "default_retry_sleeps")]
    pub retry_sleeps: Vec<u64>,
    /// Backend sections, by backend name
    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

impl ComputeConfig {
    /// Configuration for `backend` with default retry settings and no section.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            invocation_retry: default_invocation_retry(),
            retries: default_retries(),
            retry_sleeps: default_retry_sleeps(),
            sections: BTreeMap::new(),
        }
    }

    /// Attach the section of the selected backend.
    pub fn with_section(mut self, section: Value) -> Self {
        self.sections.insert(self.backend.clone(), section);
        self
    }

    /// Section of the selected backend (`null` when absent).
    pub fn backend_section(&self) -> Value {
        self.sections
            .get(&self.backend)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Backoff sleeps as durations.
    pub fn retry_sleeps(&self) -> Vec<Duration> {
        self.retry_sleeps
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    /// Stable identity of this configuration, used as the instance cache key.
    pub fn cache_key(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ComputeError::Config(e.to_string()))
    }

    /// Check settings that would make the dispatch layer misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() {
            return Err(ComputeError::Config("backend must be set".to_string()));
        }
        if self.retries == 0 {
            return Err(ComputeError::Config(
                "retries must be at least 1".to_string(),
            ));
        }
        if self.invocation_retry && self.retries > 1 && self.retry_sleeps.is_empty() {
            return Err(ComputeError::Config(
                "retry_sleeps must not be empty when invocation_retry is enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from environment variables.
    ///
    /// `CUMULUS_COMPUTE_CONFIG` names a JSON file holding the whole
    /// configuration. Otherwise it is assembled from
    /// `CUMULUS_COMPUTE_BACKEND` (default `http_service`),
    /// `CUMULUS_INVOCATION_RETRY`, `CUMULUS_RETRIES`,
    /// `CUMULUS_RETRY_SLEEPS` (comma-separated seconds) and
    /// `CUMULUS_COMPUTE_BACKEND_CONFIG` (JSON of the backend section).
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var("CUMULUS_COMPUTE_CONFIG") {
            let raw = std::fs::read(&path)
                .map_err(|e| ComputeError::Config(format!("reading {}: {}", path, e)))?;
            let config: Self = serde_json::from_slice(&raw)
                .map_err(|e| ComputeError::Config(format!("parsing {}: {}", path, e)))?;
            config.validate()?;
            return Ok(config);
        }

        let backend = std::env::var("CUMULUS_COMPUTE_BACKEND")
            .unwrap_or_else(|_| "http_service".to_string());
        let mut config = Self::new(backend);

        if let Ok(value) = std::env::var("CUMULUS_INVOCATION_RETRY") {
            config.invocation_retry =
                matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(value) = std::env::var("CUMULUS_RETRIES") {
            config.retries = value
                .parse()
                .map_err(|_| ComputeError::Config(format!("invalid CUMULUS_RETRIES: {}", value)))?;
        }
        if let Ok(value) = std::env::var("CUMULUS_RETRY_SLEEPS") {
            config.retry_sleeps = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse().map_err(|_| {
                        ComputeError::Config(format!("invalid CUMULUS_RETRY_SLEEPS entry: {}", s))
                    })
                })
                .collect::<Result<_>>()?;
        }
        if let Ok(value) = std::env::var("CUMULUS_COMPUTE_BACKEND_CONFIG") {
            let section = serde_json::from_str(&value).map_err(|e| {
                ComputeError::Config(format!("invalid CUMULUS_COMPUTE_BACKEND_CONFIG: {}", e))
            })?;
            config = config.with_section(section);
        }

        config.validate()?;
        Ok(config)
    }
}
