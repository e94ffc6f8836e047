// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cumulus-worker.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::unit::UnitKind;

/// Parse an env var into a bool with a sensible default.
fn parse_env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

/// Parse a comma-separated env var into a list, dropping empty entries.
fn parse_env_list(var: &str) -> Vec<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP address for the `serve` entrypoint
    pub http_addr: SocketAddr,
    /// Scratch directory for task directories, logs and stats files
    pub work_dir: PathBuf,
    /// Root of the local payload store
    pub storage_dir: PathBuf,
    /// Key prefix under which call status records are written
    pub status_prefix: String,
    /// Which task unit implementation to use
    pub unit_kind: UnitKind,
    /// Program launched per task by the process unit
    pub runner_program: Option<PathBuf>,
    /// Extra arguments passed to the runner program (before the task spec path)
    pub runner_args: Vec<String>,
    /// Grace period between SIGTERM and SIGKILL on timeout
    pub kill_grace: Duration,
    /// Keep task directories after finalization (for debugging)
    pub keep_task_dirs: bool,
    /// Packages advertised by the `/preinstalls` route
    pub preinstalls: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("CUMULUS_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let work_dir = PathBuf::from(
            std::env::var("CUMULUS_WORK_DIR").unwrap_or_else(|_| "/tmp/cumulus".to_string()),
        );

        let storage_dir = PathBuf::from(
            std::env::var("CUMULUS_STORAGE_DIR").unwrap_or_else(|_| ".data".to_string()),
        );

        let status_prefix =
            std::env::var("CUMULUS_STATUS_PREFIX").unwrap_or_else(|_| "jobs".to_string());

        let unit_kind = match std::env::var("CUMULUS_UNIT_KIND") {
            Ok(value) => value
                .parse()
                .map_err(|_| ConfigError::InvalidUnitKind(value))?,
            Err(_) => UnitKind::detect(),
        };

        let runner_program = std::env::var("CUMULUS_RUNNER_PROGRAM")
            .ok()
            .map(PathBuf::from);

        if unit_kind == UnitKind::Process && runner_program.is_none() {
            return Err(ConfigError::MissingEnvVar("CUMULUS_RUNNER_PROGRAM"));
        }

        let kill_grace = Duration::from_millis(
            std::env::var("CUMULUS_KILL_GRACE_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2000),
        );

        Ok(Self {
            http_addr,
            work_dir,
            storage_dir,
            status_prefix,
            unit_kind,
            runner_program,
            runner_args: parse_env_list("CUMULUS_RUNNER_ARGS"),
            kill_grace,
            keep_task_dirs: parse_env_bool("CUMULUS_KEEP_TASK_DIRS", true),
            preinstalls: parse_env_list("CUMULUS_PREINSTALLS"),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// The unit kind is not one of `process` or `inline`.
    #[error("Invalid unit kind: {0}")]
    InvalidUnitKind(String),
}
