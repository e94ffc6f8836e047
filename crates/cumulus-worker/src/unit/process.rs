// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process task unit.
//!
//! Launches the configured job runner program once per task:
//! `{program} {args...} {task_dir}/task.json`, with the task's environment
//! overlay, its working directory set to the task directory, and stdout and
//! stderr appended to the task log. Completion is signaled through a FIFO
//! in the task directory that the runner writes `done` into.
//!
//! Each runner leads its own process group. Termination signals the group,
//! so processes forked by a wrapper script stop with it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{LaunchRequest, Result, TaskUnit, UnitError, UnitKind, UnitLauncher};
use crate::child::{DONE_FIFO_ENV, DONE_MESSAGE, STATS_FILE_ENV, TASK_SPEC_ENV};
use crate::config::{Config, ConfigError};

/// How long to wait for buffered FIFO data once the child has exited.
const COMPLETION_READ_GRACE: Duration = Duration::from_millis(200);

/// Launcher that runs each task in a separate OS process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    kill_grace: Duration,
}

impl ProcessLauncher {
    /// Create a launcher for `program` with leading `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            kill_grace: Duration::from_secs(2),
        }
    }

    /// Set the grace period between SIGTERM and SIGKILL.
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    /// Build the launcher from worker configuration.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let program = config
            .runner_program
            .clone()
            .ok_or(ConfigError::MissingEnvVar("CUMULUS_RUNNER_PROGRAM"))?;
        Ok(Self::new(program, config.runner_args.clone()).with_kill_grace(config.kill_grace))
    }

    /// Program launched per task.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Create the completion FIFO and open its read end.
///
/// The read end is opened before the child starts, so the child's blocking
/// open for writing never waits and its message stays buffered until read.
fn open_completion_fifo(path: &Path) -> Result<pipe::Receiver> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(UnitError::Io(e)),
    }
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|e| UnitError::Channel(format!("mkfifo {}: {}", path.display(), e)))?;
    pipe::OpenOptions::new()
        .open_receiver(path)
        .map_err(|e| UnitError::Channel(format!("open {}: {}", path.display(), e)))
}

#[async_trait]
impl UnitLauncher for ProcessLauncher {
    fn kind(&self) -> UnitKind {
        UnitKind::Process
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<Box<dyn TaskUnit>> {
        let spec = request.spec;
        let fifo = spec
            .done_fifo
            .clone()
            .unwrap_or_else(|| spec.task_dir.join("done.fifo"));
        let receiver = open_completion_fifo(&fifo)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(request.spec_path)
            .envs(request.env)
            .env(TASK_SPEC_ENV, request.spec_path)
            .env(STATS_FILE_ENV, &spec.stats_file)
            .env(DONE_FIFO_ENV, &fifo)
            .current_dir(&spec.task_dir)
            .stdin(Stdio::null())
            .stdout(request.log.stdio()?)
            .stderr(request.log.stdio()?)
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| UnitError::SpawnFailed {
            program: self.program.clone(),
            source,
        })?;

        let pid = child.id();
        debug!(call_id = %spec.call_id, pid = ?pid, program = %self.program.display(), "Job runner process started");

        Ok(Box::new(ProcessUnit {
            child,
            receiver,
            pid,
            kill_grace: self.kill_grace,
        }))
    }
}

/// Send `signal` to a process group. A group that is already gone is fine.
fn signal_group(group: Pid, signal: Signal) {
    match signal::killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = %group, signal = ?signal, error = %e, "Failed to signal process group"),
    }
}

/// A job runner running as a child process.
struct ProcessUnit {
    child: Child,
    receiver: pipe::Receiver,
    pid: Option<u32>,
    kill_grace: Duration,
}

#[async_trait]
impl TaskUnit for ProcessUnit {
    fn label(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {}", pid),
            None => "exited process".to_string(),
        }
    }

    async fn join(&mut self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid = ?self.pid, status = %status, "Job runner process exited");
                Ok(true)
            }
            Ok(Err(e)) => Err(UnitError::Io(e)),
            Err(_) => Ok(false),
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        // The runner leads its own process group, so signals reach anything it forked
        let Some(pid) = self.pid else {
            self.child.kill().await?;
            return Ok(());
        };
        let group = Pid::from_raw(pid as i32);

        signal_group(group, Signal::SIGTERM);
        let exited = matches!(
            tokio::time::timeout(self.kill_grace, self.child.wait()).await,
            Ok(Ok(_))
        );
        if exited {
            info!(pid = pid, "Job runner terminated");
        } else {
            warn!(pid = pid, "Job runner ignored SIGTERM, killing");
        }

        // Stragglers in the group get SIGKILL even when the runner itself exited
        signal_group(group, Signal::SIGKILL);
        if !exited {
            self.child.kill().await?;
        }
        Ok(())
    }

    async fn completion_signaled(&mut self) -> bool {
        let mut buf = [0u8; 4];
        match tokio::time::timeout(COMPLETION_READ_GRACE, self.receiver.read_exact(&mut buf)).await
        {
            Ok(Ok(_)) => &buf == DONE_MESSAGE,
            Ok(Err(e)) => {
                debug!(pid = ?self.pid, error = %e, "Completion channel closed without message");
                false
            }
            Err(_) => false,
        }
    }
}
