// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Invocations follow a script of outcomes, then fall back to a default.
//! Runtimes live in an in-memory table.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{
    BackendResult, ComputeBackend, InvocationHandle, InvokePayload, RuntimeInfo, RuntimeMeta,
};
use crate::error::BackendError;

/// Scripted result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockOutcome {
    /// Accepted, handle derived from the payload
    Handle,
    /// Not accepted, no handle
    Absent,
    /// Backend error
    Error,
}

#[derive(Debug, Default, Deserialize)]
struct MockSection {
    #[serde(default)]
    outcomes: Vec<MockOutcome>,
    #[serde(default)]
    preinstalls: Vec<String>,
}

/// In-memory compute backend.
pub struct MockBackend {
    outcomes: Mutex<VecDeque<MockOutcome>>,
    runtimes: Mutex<BTreeMap<(String, u32), Duration>>,
    built: Mutex<Vec<String>>,
    invocations: AtomicUsize,
    /// Outcome once the script is exhausted
    pub default_outcome: MockOutcome,
    /// Packages reported as runtime metadata
    pub preinstalls: Vec<String>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Registry name.
    pub const NAME: &'static str = "mock";

    /// Backend that accepts every invocation.
    pub fn new() -> Self {
        Self::with_outcomes(Vec::new())
    }

    /// Backend that follows `outcomes`, then accepts.
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            runtimes: Mutex::new(BTreeMap::new()),
            built: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
            default_outcome: MockOutcome::Handle,
            preinstalls: Vec::new(),
        }
    }

    /// Backend that never produces a handle.
    pub fn failing() -> Self {
        Self {
            default_outcome: MockOutcome::Absent,
            ..Self::new()
        }
    }

    /// Build from a configuration section:
    /// `{"outcomes": ["absent", "handle"], "preinstalls": [...]}`.
    pub fn from_section(section: &Value) -> BackendResult<Self> {
        let section: MockSection = if section.is_null() {
            MockSection::default()
        } else {
            serde_json::from_value(section.clone())
                .map_err(|e| BackendError::Config(e.to_string()))?
        };
        Ok(Self {
            preinstalls: section.preinstalls,
            ..Self::with_outcomes(section.outcomes)
        })
    }

    /// Number of `invoke` calls so far.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Names of the images built so far.
    pub async fn built(&self) -> Vec<String> {
        self.built.lock().await.clone()
    }

    async fn next_outcome(&self) -> MockOutcome {
        self.outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<Option<InvocationHandle>> {
        let attempt = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self.next_outcome().await;
        debug!(
            runtime = runtime_name,
            memory = memory,
            call_id = %payload.call_id,
            attempt = attempt,
            outcome = ?outcome,
            "Mock invocation"
        );
        match outcome {
            MockOutcome::Handle => Ok(Some(payload.handle())),
            MockOutcome::Absent => Ok(None),
            MockOutcome::Error => Err(BackendError::Scripted(format!(
                "scripted failure on attempt {}",
                attempt
            ))),
        }
    }

    async fn invoke_with_result(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<(Option<InvocationHandle>, Value)> {
        if payload.route() == "/preinstalls" {
            let meta = self.generate_runtime_meta(runtime_name, memory).await?;
            return Ok((Some(payload.handle()), serde_json::to_value(meta)?));
        }
        let handle = self.invoke(runtime_name, memory, payload).await?;
        Ok((handle, json!({})))
    }

    async fn create_runtime(
        &self,
        runtime_name: &str,
        memory: u32,
        timeout: Duration,
    ) -> BackendResult<RuntimeMeta> {
        self.runtimes
            .lock()
            .await
            .insert((runtime_name.to_string(), memory), timeout);
        self.generate_runtime_meta(runtime_name, memory).await
    }

    async fn build_runtime(
        &self,
        runtime_name: &str,
        _dockerfile: Option<&Path>,
    ) -> BackendResult<()> {
        self.built.lock().await.push(runtime_name.to_string());
        Ok(())
    }

    async fn delete_runtime(&self, runtime_name: &str, memory: u32) -> BackendResult<()> {
        self.runtimes
            .lock()
            .await
            .remove(&(runtime_name.to_string(), memory));
        Ok(())
    }

    async fn delete_all_runtimes(&self) -> BackendResult<()> {
        self.runtimes.lock().await.clear();
        Ok(())
    }

    async fn list_runtimes(&self, runtime_name: Option<&str>) -> BackendResult<Vec<RuntimeInfo>> {
        Ok(self
            .runtimes
            .lock()
            .await
            .keys()
            .filter(|(name, _)| runtime_name.is_none_or(|wanted| name == wanted))
            .map(|(name, memory)| RuntimeInfo {
                name: name.clone(),
                memory: *memory,
            })
            .collect())
    }

    fn get_runtime_key(&self, runtime_name: &str, memory: u32) -> String {
        format!("mock/{}--{}mb", runtime_name, memory)
    }

    async fn generate_runtime_meta(
        &self,
        _runtime_name: &str,
        _memory: u32,
    ) -> BackendResult<RuntimeMeta> {
        Ok(RuntimeMeta {
            preinstalls: self.preinstalls.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        })
    }
}
