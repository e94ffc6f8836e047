// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job payload and task types.
//!
//! A [`Job`] is what a compute backend delivers to the worker: the list of
//! call ids to run, where the shared function and per-call input live in the
//! payload store, and the execution settings shared by every task.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

fn default_worker_processes() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A batch of tasks sharing one function and configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Executor (client session) that submitted the job
    pub executor_id: String,
    /// Job identifier within the executor
    pub job_id: String,
    /// Unique key for this submission, used for directories and status keys
    pub job_key: String,
    /// Ordered task identifiers
    pub call_ids: Vec<String>,
    /// Store key of the serialized function
    pub func_key: String,
    /// Store key of the object holding every task's input
    pub data_key: String,
    /// Half-open byte range `[start, end)` of each task's input, one per call id
    pub data_byte_ranges: Vec<(u64, u64)>,
    /// Requested worker pool size
    #[serde(default = "default_worker_processes")]
    pub worker_processes: usize,
    /// Per-task wall-clock limit in seconds
    pub execution_timeout: u64,
    /// Runtime the job was dispatched to
    pub runtime_name: String,
    /// Runtime memory in MB, when the backend has memory tiers
    #[serde(default)]
    pub runtime_memory: Option<u32>,
    /// Environment overlay applied to every task
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    /// Opaque configuration forwarded to the job runner
    #[serde(default)]
    pub config: Value,
    /// Log level requested by the client
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Job {
    /// Execution timeout as a duration.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout)
    }

    /// Number of workers the batch will actually use.
    pub fn pool_size(&self) -> usize {
        self.worker_processes.min(self.call_ids.len())
    }

    /// Session identifier exported to the task as `CUMULUS_SESSION_ID`.
    pub fn session_id(&self, call_id: &str) -> String {
        format!("{}-{}", self.job_key, call_id)
    }

    /// Check the payload for inconsistencies that make the whole job unrunnable.
    pub fn validate(&self) -> Result<()> {
        if self.call_ids.is_empty() {
            return Err(Error::InvalidJob("job has no call ids".to_string()));
        }
        if self.worker_processes == 0 {
            return Err(Error::InvalidJob(
                "worker_processes must be at least 1".to_string(),
            ));
        }
        if self.execution_timeout == 0 {
            return Err(Error::InvalidJob(
                "execution_timeout must be at least 1 second".to_string(),
            ));
        }
        if self.data_byte_ranges.len() != self.call_ids.len() {
            return Err(Error::InvalidJob(format!(
                "{} byte ranges for {} call ids",
                self.data_byte_ranges.len(),
                self.call_ids.len()
            )));
        }
        if !is_path_segment(&self.job_key) {
            return Err(Error::InvalidJob(format!(
                "job_key {:?} is not a valid path segment",
                self.job_key
            )));
        }

        let mut seen = HashSet::new();
        for call_id in &self.call_ids {
            if !is_path_segment(call_id) {
                return Err(Error::InvalidJob(format!(
                    "call id {:?} is not a valid path segment",
                    call_id
                )));
            }
            if !seen.insert(call_id.as_str()) {
                return Err(Error::InvalidJob(format!("duplicate call id {}", call_id)));
            }
        }
        Ok(())
    }
}

/// Single normal path component: no separators, no `.`/`..`.
fn is_path_segment(s: &str) -> bool {
    let mut components = Path::new(s).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !s.contains('/')
}

/// One `(job, call_id, input)` unit pulled from the work queue.
#[derive(Debug, Clone)]
pub struct Task {
    /// Job the task belongs to
    pub job: Arc<Job>,
    /// Task identifier
    pub call_id: String,
    /// Input data, resolved before enqueue
    pub data: Bytes,
}
