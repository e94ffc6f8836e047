// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job runner side of the task protocol.
//!
//! A job runner is started once per task. It finds its [`TaskSpec`] through
//! the last command-line argument (or `CUMULUS_TASK_SPEC`), runs the user
//! function, writes the stats file and finally writes `done` to the
//! completion FIFO. A runner that exits without the `done` message is
//! treated as killed for exceeding its memory.
//!
//! ```ignore
//! fn main() -> std::io::Result<()> {
//!     cumulus_worker::child::run_child(|spec, input| {
//!         let n: u64 = serde_json::from_slice(&input)
//!             .map_err(|e| ErrorEnvelope::new("decode", e.to_string()))?;
//!         Ok(n * 2)
//!     })
//! }
//! ```

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ErrorEnvelope;
use crate::stats::StatsWriter;

/// Set to `True` for every job runner.
pub const WORKER_ENV: &str = "CUMULUS_WORKER";
/// Job configuration as JSON.
pub const CONFIG_ENV: &str = "CUMULUS_CONFIG";
/// `{job_key}-{call_id}`.
pub const SESSION_ID_ENV: &str = "CUMULUS_SESSION_ID";
/// Path of the task spec JSON.
pub const TASK_SPEC_ENV: &str = "CUMULUS_TASK_SPEC";
/// Path of the stats file the runner must write.
pub const STATS_FILE_ENV: &str = "CUMULUS_STATS_FILE";
/// Path of the completion FIFO.
pub const DONE_FIFO_ENV: &str = "CUMULUS_DONE_FIFO";

/// The completion message.
pub const DONE_MESSAGE: &[u8; 4] = b"done";

/// Description of one task, written by the engine for the job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Executor that submitted the job
    pub executor_id: String,
    /// Job identifier
    pub job_id: String,
    /// Job submission key
    pub job_key: String,
    /// Task identifier
    pub call_id: String,
    /// Task working directory
    pub task_dir: PathBuf,
    /// Serialized function, shared by all tasks of the job
    pub func_path: PathBuf,
    /// This task's input
    pub data_path: PathBuf,
    /// Stats file to write
    pub stats_file: PathBuf,
    /// Completion FIFO, absent for inline units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_fifo: Option<PathBuf>,
    /// Execution timeout in seconds
    pub execution_timeout: u64,
    /// Runtime name
    pub runtime_name: String,
    /// Runtime memory in MB
    #[serde(default)]
    pub runtime_memory: Option<u32>,
    /// Requested log level
    pub log_level: String,
    /// Opaque job configuration
    #[serde(default)]
    pub config: Value,
}

impl TaskSpec {
    /// Load a spec from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Locate and load the spec: last argument first, then `CUMULUS_TASK_SPEC`.
    pub fn from_process() -> io::Result<Self> {
        let from_args = std::env::args_os()
            .skip(1)
            .last()
            .map(PathBuf::from)
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"));
        let path = match from_args {
            Some(path) => path,
            None => std::env::var_os(TASK_SPEC_ENV).map(PathBuf::from).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no task spec argument and {} is not set", TASK_SPEC_ENV),
                )
            })?,
        };
        Self::load(&path)
    }

    /// Read this task's input.
    pub fn read_input(&self) -> io::Result<Vec<u8>> {
        std::fs::read(&self.data_path)
    }
}

/// Write the completion message to the FIFO.
pub fn signal_done(fifo: &Path) -> io::Result<()> {
    let mut pipe = OpenOptions::new().write(true).open(fifo)?;
    pipe.write_all(DONE_MESSAGE)?;
    pipe.flush()
}

/// Write a function outcome to the stats file.
///
/// Success writes `result` and `exception false`; failure writes the error
/// envelope under `exception`. Both record `function_exec_time` in seconds.
pub fn write_outcome(
    stats_file: &Path,
    outcome: &Result<Value, ErrorEnvelope>,
    elapsed: Duration,
) -> io::Result<()> {
    let mut stats = StatsWriter::create(stats_file)?;
    match outcome {
        Ok(result) => {
            stats.write_json("result", result)?;
            stats.write_json("exception", &Value::Bool(false))?;
        }
        Err(envelope) => {
            stats.write_json("exception", &serde_json::to_value(envelope)?)?;
        }
    }
    stats.write_number("function_exec_time", elapsed.as_secs_f64())?;
    stats.finish()
}

/// Run a job runner body and complete the task protocol.
///
/// A result that cannot be serialized is reported under `exc_pickle_fail`.
pub fn run_child<F, T>(function: F) -> io::Result<()>
where
    F: FnOnce(&TaskSpec, Vec<u8>) -> Result<T, ErrorEnvelope>,
    T: Serialize,
{
    let spec = TaskSpec::from_process()?;
    let input = spec.read_input()?;

    let start = Instant::now();
    let outcome = function(&spec, input);
    let elapsed = start.elapsed();

    match outcome.map(|value| serde_json::to_value(value)) {
        Ok(Ok(value)) => write_outcome(&spec.stats_file, &Ok(value), elapsed)?,
        Ok(Err(e)) => {
            let mut stats = StatsWriter::create(&spec.stats_file)?;
            let envelope = ErrorEnvelope::capture("serialization", &e);
            stats.write_json("exc_pickle_fail", &serde_json::to_value(&envelope)?)?;
            stats.write_json("exception", &Value::Bool(true))?;
            stats.write_number("function_exec_time", elapsed.as_secs_f64())?;
            stats.finish()?;
        }
        Err(envelope) => write_outcome(&spec.stats_file, &Err(envelope), elapsed)?,
    }

    if let Some(fifo) = &spec.done_fifo {
        signal_done(fifo)?;
    }
    Ok(())
}
