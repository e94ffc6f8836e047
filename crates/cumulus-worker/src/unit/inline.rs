// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inline task unit.
//!
//! Runs a [`JobFunction`] as a tokio task inside the worker process. Used on
//! hosts without process support and in tests. The environment overlay is
//! handed to the function through [`TaskContext::env`] instead of being
//! applied to the worker's own environment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{LaunchRequest, Result, TaskUnit, UnitKind, UnitLauncher};
use crate::child::{TaskSpec, write_outcome};
use crate::envelope::ErrorEnvelope;
use crate::tasklog::TaskLog;

/// What an inline job function receives.
#[derive(Clone)]
pub struct TaskContext {
    /// Task description
    pub spec: TaskSpec,
    /// Task input
    pub data: Bytes,
    /// Environment overlay for this task
    pub env: BTreeMap<String, String>,
    /// Task log
    pub log: TaskLog,
}

/// A user function runnable by the inline unit.
#[async_trait]
pub trait JobFunction: Send + Sync {
    /// Run the function for one task.
    async fn call(&self, ctx: TaskContext) -> std::result::Result<Value, ErrorEnvelope>;
}

/// Launcher running every task through one shared [`JobFunction`].
#[derive(Clone)]
pub struct InlineLauncher {
    function: Arc<dyn JobFunction>,
}

impl InlineLauncher {
    /// Create a launcher for `function`.
    pub fn new(function: Arc<dyn JobFunction>) -> Self {
        Self { function }
    }
}

#[async_trait]
impl UnitLauncher for InlineLauncher {
    fn kind(&self) -> UnitKind {
        UnitKind::Inline
    }

    async fn launch(&self, request: LaunchRequest<'_>) -> Result<Box<dyn TaskUnit>> {
        let ctx = TaskContext {
            spec: request.spec.clone(),
            data: request.data,
            env: request.env.clone(),
            log: request.log.clone(),
        };
        let label = format!("inline {}", ctx.spec.call_id);
        let function = self.function.clone();
        let (done_tx, done_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let stats_file = ctx.spec.stats_file.clone();
            let start = Instant::now();
            let outcome = function.call(ctx).await;
            if let Err(e) = write_outcome(&stats_file, &outcome, start.elapsed()) {
                warn!(error = %e, "Failed to write stats file");
                return;
            }
            let _ = done_tx.send(());
        });

        debug!(unit = %label, "Inline unit started");
        Ok(Box::new(InlineUnit {
            label,
            handle,
            done_rx,
        }))
    }
}

struct InlineUnit {
    label: String,
    handle: JoinHandle<()>,
    done_rx: oneshot::Receiver<()>,
}

#[async_trait]
impl TaskUnit for InlineUnit {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn join(&mut self, timeout: Duration) -> Result<bool> {
        if self.handle.is_finished() {
            return Ok(true);
        }
        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => Ok(true),
            // A panicking function dies without a completion message
            Ok(Err(e)) => {
                warn!(unit = %self.label, error = %e, "Inline unit aborted");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn terminate(&mut self) -> Result<()> {
        if !self.handle.is_finished() {
            self.handle.abort();
            let _ = (&mut self.handle).await;
        }
        Ok(())
    }

    async fn completion_signaled(&mut self) -> bool {
        self.done_rx.try_recv().is_ok()
    }
}
