// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cumulus-worker integration tests.
//!
//! Provides TestContext with an in-memory store, a recording reporter and a
//! scratch work directory, plus helpers for job runner scripts.

#![allow(dead_code)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tempfile::TempDir;

use cumulus_worker::engine::{EngineConfig, ExecutionEngine};
use cumulus_worker::envelope::ErrorEnvelope;
use cumulus_worker::job::Job;
use cumulus_worker::status::MockReporter;
use cumulus_worker::storage::{MemoryObjectStore, ObjectStore};
use cumulus_worker::unit::{InlineLauncher, JobFunction, ProcessLauncher, TaskContext};

/// Job runner that completes normally, echoing its input and session id.
pub const ECHO_SCRIPT: &str = r#"#!/bin/sh
input=$(cat data.bin)
printf 'result {"input": "%s", "session": "%s", "leak": "%s"}\n' "$input" "$CUMULUS_SESSION_ID" "$CUMULUS_TEST_OVERLAY" > "$CUMULUS_STATS_FILE"
printf 'exception false\nfunction_exec_time 0.01\n' >> "$CUMULUS_STATS_FILE"
printf done > "$CUMULUS_DONE_FIFO"
"#;

/// Job runner that sleeps on input `slow`, and echoes otherwise.
pub const SLOW_SCRIPT: &str = r#"#!/bin/sh
input=$(cat data.bin)
if [ "$input" = "slow" ]; then
    exec sleep 30
fi
printf 'result "%s"\n' "$input" > "$CUMULUS_STATS_FILE"
printf done > "$CUMULUS_DONE_FIFO"
"#;

/// Job runner that forks a long sleep, records its pid, and waits on it.
pub const FORKING_SCRIPT: &str = r#"#!/bin/sh
sleep 37 &
echo $! > grandchild.pid
wait
"#;

/// Job runner killed before it can signal completion.
pub const KILLED_SCRIPT: &str = r#"#!/bin/sh
echo "allocating"
kill -9 $$
"#;

/// Job runner whose function raised.
pub const RAISING_SCRIPT: &str = r#"#!/bin/sh
echo "about to fail" >&2
printf 'exception {"kind": "ValueError", "message": "bad input"}\n' > "$CUMULUS_STATS_FILE"
printf 'function_exec_time 0.5\n' >> "$CUMULUS_STATS_FILE"
printf done > "$CUMULUS_DONE_FIFO"
"#;

/// Test context holding the store, reporter and work directory.
pub struct TestContext {
    pub store: Arc<MemoryObjectStore>,
    pub reporter: Arc<MockReporter>,
    pub work_dir: PathBuf,
    _temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("temp dir");
        let work_dir = temp_dir.path().join("work");
        std::fs::create_dir_all(&work_dir).expect("work dir");
        Self {
            store: Arc::new(MemoryObjectStore::new()),
            reporter: Arc::new(MockReporter::new()),
            work_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Write an executable job runner script.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self._temp_dir.path().join(name);
        std::fs::write(&path, body).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        path
    }

    pub fn process_engine(&self, program: &Path) -> ExecutionEngine {
        let launcher = ProcessLauncher::new(program, Vec::new())
            .with_kill_grace(Duration::from_millis(200));
        ExecutionEngine::new(
            self.store.clone(),
            self.reporter.clone(),
            Arc::new(launcher),
            EngineConfig::new(&self.work_dir),
        )
    }

    pub fn inline_engine(&self, function: Arc<dyn JobFunction>) -> ExecutionEngine {
        ExecutionEngine::new(
            self.store.clone(),
            self.reporter.clone(),
            Arc::new(InlineLauncher::new(function)),
            EngineConfig::new(&self.work_dir),
        )
    }

    /// Upload a function and one input per call id, and build the job.
    pub async fn job(
        &self,
        job_id: &str,
        inputs: &[(&str, &str)],
        worker_processes: usize,
        execution_timeout: u64,
    ) -> Job {
        let job_key = format!("exec-{}", job_id);
        let func_key = format!("exec/{}/func.bin", job_id);
        let data_key = format!("exec/{}/data.bin", job_id);

        let mut data = Vec::new();
        let mut ranges = Vec::new();
        for (_, input) in inputs {
            let start = data.len() as u64;
            data.extend_from_slice(input.as_bytes());
            ranges.push((start, data.len() as u64));
        }

        self.store
            .put(&func_key, Bytes::from_static(b"serialized function"))
            .await
            .expect("put func");
        self.store
            .put(&data_key, Bytes::from(data))
            .await
            .expect("put data");

        serde_json::from_value(json!({
            "executor_id": "exec",
            "job_id": job_id,
            "job_key": job_key,
            "call_ids": inputs.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            "func_key": func_key,
            "data_key": data_key,
            "data_byte_ranges": ranges,
            "worker_processes": worker_processes,
            "execution_timeout": execution_timeout,
            "runtime_name": "cumulus/runtime:latest",
            "runtime_memory": 256,
            "config": {"storage": "memory"},
        }))
        .expect("job payload")
    }
}

/// Scripted behavior of an inline function for one call id.
#[derive(Clone)]
pub enum Behavior {
    Return(Value),
    Sleep(Duration, Value),
    Fail(ErrorEnvelope),
    Hang,
}

/// Inline job function driven by a per-call-id script.
pub struct Scripted {
    behaviors: HashMap<String, Behavior>,
}

impl Scripted {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(id, b)| (id.to_string(), b.clone()))
                .collect(),
        })
    }
}

#[async_trait]
impl JobFunction for Scripted {
    async fn call(&self, ctx: TaskContext) -> Result<Value, ErrorEnvelope> {
        ctx.log.line("INFO", format!("running {}", ctx.spec.call_id));
        match self.behaviors.get(&ctx.spec.call_id) {
            Some(Behavior::Return(value)) => Ok(value.clone()),
            Some(Behavior::Sleep(duration, value)) => {
                tokio::time::sleep(*duration).await;
                Ok(value.clone())
            }
            Some(Behavior::Fail(envelope)) => Err(envelope.clone()),
            Some(Behavior::Hang) => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
            None => Ok(json!({
                "input": String::from_utf8_lossy(&ctx.data),
                "session": ctx.env.get("CUMULUS_SESSION_ID"),
            })),
        }
    }
}

/// Whether `pid` names a live, non-zombie process.
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // State follows the parenthesized command name
        Ok(stat) => stat
            .rsplit_once(") ")
            .map(|(_, rest)| !rest.starts_with('Z') && !rest.starts_with('X'))
            .unwrap_or(false),
        Err(_) => false,
    }
}
