// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task units - the isolated child that runs one task's job runner.
//!
//! The engine supervises every task through the [`TaskUnit`] contract, so
//! its timeout and out-of-memory policy is the same whether the job runner
//! is a separate OS process ([`ProcessLauncher`]) or an in-process tokio
//! task ([`InlineLauncher`]).

pub mod inline;
pub mod process;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::child::TaskSpec;
use crate::tasklog::TaskLog;

pub use inline::{InlineLauncher, JobFunction, TaskContext};
pub use process::ProcessLauncher;

/// Errors from task unit operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UnitError {
    /// The job runner program could not be started.
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        /// Program that failed to start.
        program: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The completion channel could not be set up.
    #[error("Completion channel error: {0}")]
    Channel(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for unit operations.
pub type Result<T> = std::result::Result<T, UnitError>;

/// Which kind of task unit the engine launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Separate OS process per task
    Process,
    /// Tokio task inside the worker process
    Inline,
}

impl UnitKind {
    /// Best unit kind for the host: processes where the platform has them.
    pub fn detect() -> Self {
        if cfg!(unix) {
            UnitKind::Process
        } else {
            UnitKind::Inline
        }
    }

    /// Name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Process => "process",
            UnitKind::Inline => "inline",
        }
    }
}

impl FromStr for UnitKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(UnitKind::Process),
            "inline" | "thread" => Ok(UnitKind::Inline),
            other => Err(other.to_string()),
        }
    }
}

/// Everything a launcher needs to start one task.
pub struct LaunchRequest<'a> {
    /// Task description, also written to `spec_path`
    pub spec: &'a TaskSpec,
    /// Location of the serialized task spec
    pub spec_path: &'a std::path::Path,
    /// Environment overlay for the job runner
    pub env: &'a BTreeMap<String, String>,
    /// Task log receiving the unit's output
    pub log: &'a TaskLog,
    /// Task input
    pub data: Bytes,
}

/// A running job runner for one task.
#[async_trait]
pub trait TaskUnit: Send {
    /// Identifier for logs (pid, or a task label).
    fn label(&self) -> String;

    /// Wait up to `timeout` for the unit to exit. Returns whether it exited.
    async fn join(&mut self, timeout: Duration) -> Result<bool>;

    /// Stop the unit. Must leave it no longer running.
    async fn terminate(&mut self) -> Result<()>;

    /// Whether the unit sent its `done` message before exiting.
    async fn completion_signaled(&mut self) -> bool;
}

/// Factory for task units.
#[async_trait]
pub trait UnitLauncher: Send + Sync {
    /// Kind of unit this launcher produces.
    fn kind(&self) -> UnitKind;

    /// Start the job runner for one task.
    async fn launch(&self, request: LaunchRequest<'_>) -> Result<Box<dyn TaskUnit>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_kind_parse() {
        assert_eq!("process".parse::<UnitKind>(), Ok(UnitKind::Process));
        assert_eq!("Inline".parse::<UnitKind>(), Ok(UnitKind::Inline));
        assert_eq!("thread".parse::<UnitKind>(), Ok(UnitKind::Inline));
        assert!("wasm".parse::<UnitKind>().is_err());
    }

    #[test]
    fn test_detect_on_unix() {
        #[cfg(unix)]
        assert_eq!(UnitKind::detect(), UnitKind::Process);
    }
}
