// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution engine.
//!
//! Turns a [`Job`] into a supervised pool of workers. Each worker pulls
//! tasks from a shared queue and runs every task in its own task unit with
//! a hard wall-clock timeout. Every task ends with exactly one finish event,
//! whatever happens to its unit:
//!
//! | Unit outcome                         | Status                      |
//! |--------------------------------------|-----------------------------|
//! | outlived `execution_timeout`         | `failure = timeout`         |
//! | exited without the `done` message    | `failure = out_of_memory`   |
//! | engine failed while supervising      | `failure = internal_error`  |
//! | exited after `done`                  | fields from the stats file  |

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::child::{CONFIG_ENV, SESSION_ID_ENV, TaskSpec, WORKER_ENV};
use crate::config::Config;
use crate::envelope::ErrorEnvelope;
use crate::error::Result;
use crate::job::{Job, Task};
use crate::stats::read_stats_file;
use crate::status::{CallStatus, CallStatusReporter, FailureKind, StatusEvent, unix_now};
use crate::storage::ObjectStore;
use crate::tasklog::TaskLog;
use crate::unit::{LaunchRequest, UnitKind, UnitLauncher};

/// Engine settings that do not depend on the job.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parent of all job and task directories
    pub work_dir: PathBuf,
    /// Keep task directories after finalization
    pub keep_task_dirs: bool,
}

impl EngineConfig {
    /// Settings rooted at `work_dir`, keeping task directories.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            keep_task_dirs: true,
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            keep_task_dirs: config.keep_task_dirs,
        }
    }
}

/// Outcome of [`ExecutionEngine::run_batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// Job submission key
    pub job_key: String,
    /// Number of workers the batch ran with
    pub worker_processes: usize,
    /// Final status of every task, in `call_ids` order
    pub statuses: Vec<CallStatus>,
}

impl BatchReport {
    /// Status of one task.
    pub fn status(&self, call_id: &str) -> Option<&CallStatus> {
        self.statuses.iter().find(|s| s.call_id() == call_id)
    }
}

enum QueueItem {
    Task(Task),
    Shutdown,
}

type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<QueueItem>>>;

/// Runs batches of tasks.
///
/// Cheap to clone; clones share the store, reporter and launcher.
#[derive(Clone)]
pub struct ExecutionEngine {
    store: Arc<dyn ObjectStore>,
    reporter: Arc<dyn CallStatusReporter>,
    launcher: Arc<dyn UnitLauncher>,
    config: Arc<EngineConfig>,
}

impl ExecutionEngine {
    /// Create an engine.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reporter: Arc<dyn CallStatusReporter>,
        launcher: Arc<dyn UnitLauncher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            reporter,
            launcher,
            config: Arc::new(config),
        }
    }

    /// Directory holding the job's shared files and task directories.
    pub fn job_dir(&self, job: &Job) -> PathBuf {
        self.config.work_dir.join(&job.job_key)
    }

    /// Execute every task of `job` and report a terminal status for each.
    ///
    /// Individual task failures never fail the batch. Only setup errors
    /// escape: an invalid job, or the payload store being unreadable.
    pub async fn run_batch(&self, job: Job) -> Result<BatchReport> {
        job.validate()?;
        let job = Arc::new(job);
        let pool_size = job.pool_size();

        info!(
            job_key = %job.job_key,
            tasks = job.call_ids.len(),
            workers = pool_size,
            unit = self.launcher.kind().as_str(),
            "Starting batch"
        );

        let job_dir = self.job_dir(&job);
        tokio::fs::create_dir_all(&job_dir).await?;

        let func = self.store.get(&job.func_key).await?;
        tokio::fs::write(job_dir.join("func.bin"), &func).await?;

        let tasks = self.resolve_tasks(&job).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue: SharedQueue = Arc::new(Mutex::new(rx));
        let mut statuses = Vec::with_capacity(tasks.len());

        if pool_size == 1 {
            enqueue(&tx, tasks, 1);
            statuses.extend(self.consume(0, queue).await);
        } else {
            let mut workers = JoinSet::new();
            for worker_id in 0..pool_size {
                let engine = self.clone();
                let queue = queue.clone();
                workers.spawn(async move { engine.consume(worker_id, queue).await });
            }
            enqueue(&tx, tasks, pool_size);

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(done) => statuses.extend(done),
                    Err(e) => error!(job_key = %job.job_key, error = %e, "Worker aborted"),
                }
            }
        }

        let order: HashMap<&str, usize> = job
            .call_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        statuses.sort_by_key(|s| order.get(s.call_id()).copied().unwrap_or(usize::MAX));

        if !self.config.keep_task_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
                debug!(dir = %job_dir.display(), error = %e, "Failed to remove job directory");
            }
        }

        let failed = statuses.iter().filter(|s| s.failure().is_some()).count();
        info!(
            job_key = %job.job_key,
            tasks = statuses.len(),
            failed = failed,
            "Batch finished"
        );

        Ok(BatchReport {
            job_key: job.job_key.clone(),
            worker_processes: pool_size,
            statuses,
        })
    }

    /// Read one input per call id from its byte range of the data object.
    async fn resolve_tasks(&self, job: &Arc<Job>) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(job.call_ids.len());
        for (call_id, &(start, end)) in job.call_ids.iter().zip(&job.data_byte_ranges) {
            let data = self.store.get_range(&job.data_key, start, end).await?;
            tasks.push(Task {
                job: job.clone(),
                call_id: call_id.clone(),
                data,
            });
        }
        Ok(tasks)
    }

    /// Worker loop: run tasks until a shutdown sentinel arrives.
    async fn consume(&self, worker_id: usize, queue: SharedQueue) -> Vec<CallStatus> {
        debug!(worker_id = worker_id, "Worker started");
        let mut statuses = Vec::new();

        loop {
            let item = queue.lock().await.recv().await;
            match item {
                Some(QueueItem::Task(task)) => statuses.push(self.run_task(task).await),
                Some(QueueItem::Shutdown) | None => break,
            }
        }

        debug!(worker_id = worker_id, tasks = statuses.len(), "Worker stopped");
        statuses
    }

    /// Run one task and return its final status.
    ///
    /// Never fails: engine errors become an `internal_error` status, and the
    /// finish event is sent on every path.
    pub async fn run_task(&self, task: Task) -> CallStatus {
        let mut status = CallStatus::new(&task.job, &task.call_id);
        let task_dir = self.job_dir(&task.job).join(&task.call_id);
        let mut log = None;

        if let Err(e) = self.execute(&task, &task_dir, &mut status, &mut log).await {
            error!(
                job_key = %task.job.job_key,
                call_id = %task.call_id,
                error = %e,
                "Task failed inside the engine"
            );
            if let Some(log) = &log {
                log.line("ERROR", format!("Internal error: {}", e));
            }
            status.record_failure(
                FailureKind::InternalError,
                &ErrorEnvelope::capture(e.kind(), &e),
            );
        }

        self.finalize(&task, &task_dir, &mut status, log.as_ref())
            .await;
        status
    }

    async fn execute(
        &self,
        task: &Task,
        task_dir: &Path,
        status: &mut CallStatus,
        log_slot: &mut Option<TaskLog>,
    ) -> Result<()> {
        let job = &task.job;

        tokio::fs::create_dir_all(task_dir).await?;
        let log = TaskLog::open(task_dir.join("execution.log"))?;
        *log_slot = Some(log.clone());
        log.line(
            "INFO",
            format!("Starting execution of {} ({})", task.call_id, job.job_key),
        );

        let env = build_overlay(job, &task.call_id)?;

        self.reporter.send(StatusEvent::Init, status).await?;

        let spec = TaskSpec {
            executor_id: job.executor_id.clone(),
            job_id: job.job_id.clone(),
            job_key: job.job_key.clone(),
            call_id: task.call_id.clone(),
            task_dir: task_dir.to_path_buf(),
            func_path: self.job_dir(job).join("func.bin"),
            data_path: task_dir.join("data.bin"),
            stats_file: task_dir.join("job_stats.txt"),
            done_fifo: (self.launcher.kind() == UnitKind::Process)
                .then(|| task_dir.join("done.fifo")),
            execution_timeout: job.execution_timeout,
            runtime_name: job.runtime_name.clone(),
            runtime_memory: job.runtime_memory,
            log_level: job.log_level.clone(),
            config: job.config.clone(),
        };
        let spec_path = task_dir.join("task.json");
        tokio::fs::write(&spec_path, serde_json::to_vec_pretty(&spec)?).await?;
        tokio::fs::write(&spec.data_path, &task.data).await?;

        let mut unit = self
            .launcher
            .launch(LaunchRequest {
                spec: &spec,
                spec_path: &spec_path,
                env: &env,
                log: &log,
                data: Bytes::clone(&task.data),
            })
            .await?;
        debug!(call_id = %task.call_id, unit = %unit.label(), "Task unit launched");

        if !unit.join(job.execution_timeout()).await? {
            let message = format!(
                "Function exceeded maximum time of {} seconds and was killed",
                job.execution_timeout
            );
            warn!(call_id = %task.call_id, unit = %unit.label(), "{}", message);
            log.line("ERROR", &message);
            if let Err(e) = unit.terminate().await {
                error!(call_id = %task.call_id, error = %e, "Failed to terminate task unit");
            }
            status.record_failure(FailureKind::Timeout, &ErrorEnvelope::new("timeout", message));
            return Ok(());
        }

        if !unit.completion_signaled().await {
            let message = match job.runtime_memory {
                Some(mb) => format!(
                    "Function exited without signaling completion, most likely killed for exceeding {} MB of memory",
                    mb
                ),
                None => "Function exited without signaling completion, most likely killed for exceeding its memory".to_string(),
            };
            warn!(call_id = %task.call_id, unit = %unit.label(), "{}", message);
            log.line("ERROR", &message);
            status.record_failure(
                FailureKind::OutOfMemory,
                &ErrorEnvelope::new("out_of_memory", message),
            );
            return Ok(());
        }

        for (key, value) in read_stats_file(&spec.stats_file).await? {
            merge_stat(status, key, value);
        }
        log.line("INFO", format!("Finished execution of {}", task.call_id));
        Ok(())
    }

    async fn finalize(
        &self,
        task: &Task,
        task_dir: &Path,
        status: &mut CallStatus,
        log: Option<&TaskLog>,
    ) {
        status.add("worker_end_tstamp", unix_now());

        if let Some(log) = log {
            match log.encoded().await {
                Ok(encoded) => status.add("logs", encoded),
                Err(e) => warn!(call_id = %task.call_id, error = %e, "Failed to read task log"),
            }
        }

        if let Err(e) = self.reporter.send(StatusEvent::Finish, status).await {
            error!(call_id = %task.call_id, error = %e, "Failed to send finish status");
        }

        if !self.config.keep_task_dirs {
            if let Err(e) = tokio::fs::remove_dir_all(task_dir).await {
                debug!(dir = %task_dir.display(), error = %e, "Failed to remove task directory");
            }
        }

        debug!(
            call_id = %task.call_id,
            failure = ?status.failure(),
            "Task finalized"
        );
    }
}

/// Push every task, then `sentinels` shutdown markers.
fn enqueue(tx: &mpsc::UnboundedSender<QueueItem>, tasks: Vec<Task>, sentinels: usize) {
    // The receiver lives in the shared queue until every worker has stopped
    for task in tasks {
        let _ = tx.send(QueueItem::Task(task));
    }
    for _ in 0..sentinels {
        let _ = tx.send(QueueItem::Shutdown);
    }
}

/// Environment overlay handed to a task's unit.
pub fn build_overlay(job: &Job, call_id: &str) -> Result<BTreeMap<String, String>> {
    let mut env = job.extra_env.clone();
    env.insert(WORKER_ENV.to_string(), "True".to_string());
    env.insert(CONFIG_ENV.to_string(), serde_json::to_string(&job.config)?);
    env.insert(SESSION_ID_ENV.to_string(), job.session_id(call_id));
    Ok(env)
}

/// Merge one stats field. A structured `exception` moves to `exc_info`.
fn merge_stat(status: &mut CallStatus, key: String, value: Value) {
    if key == "exception" && value.is_object() {
        status.add("exc_info", value);
        status.add("exception", true);
    } else {
        status.add(key, value);
    }
}
