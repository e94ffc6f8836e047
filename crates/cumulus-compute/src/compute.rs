// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch layer: retried invocation over one configured backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{ComputeBackend, InvocationHandle, InvokePayload, RuntimeInfo, RuntimeMeta};
use crate::config::ComputeConfig;
use crate::error::Result;
use crate::registry::BackendRegistry;

/// A compute backend with the invocation retry policy applied.
pub struct Compute {
    backend: Arc<dyn ComputeBackend>,
    invocation_retry: bool,
    retries: u32,
    retry_sleeps: Vec<Duration>,
}

impl Compute {
    /// Create from configuration, using the built-in backends.
    pub fn new(config: &ComputeConfig) -> Result<Self> {
        Self::with_registry(config, &BackendRegistry::with_builtin())
    }

    /// Create from configuration, resolving the backend in `registry`.
    pub fn with_registry(config: &ComputeConfig, registry: &BackendRegistry) -> Result<Self> {
        config.validate()?;
        let backend = registry.create(&config.backend, &config.backend_section())?;
        Self::with_backend(config, backend)
    }

    /// Wrap an already constructed backend.
    pub fn with_backend(config: &ComputeConfig, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        config.validate()?;
        info!(
            backend = backend.name(),
            invocation_retry = config.invocation_retry,
            retries = config.retries,
            "Compute dispatch initialized"
        );
        Ok(Self {
            backend,
            invocation_retry: config.invocation_retry,
            retries: config.retries,
            retry_sleeps: config.retry_sleeps(),
        })
    }

    /// Process-wide shared instance for `config`.
    pub fn shared(config: &ComputeConfig) -> Result<Arc<Compute>> {
        GLOBAL_CACHE.get_or_create(config)
    }

    /// The underlying backend.
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Name of the underlying backend.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    async fn attempt(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> Option<InvocationHandle> {
        match self.backend.invoke(runtime_name, memory, payload).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    call_id = %payload.call_id,
                    runtime = runtime_name,
                    error = %e,
                    "Invocation failed"
                );
                None
            }
        }
    }

    /// Dispatch a payload, retrying while no handle comes back.
    ///
    /// At most `retries` attempts are made. Between attempts the task sleeps
    /// for a duration drawn uniformly from `retry_sleeps`. Backend errors
    /// count as a missing handle.
    pub async fn invoke(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> Option<InvocationHandle> {
        let mut attempts = 1;
        let mut handle = self.attempt(runtime_name, memory, payload).await;

        while handle.is_none() && self.invocation_retry && attempts < self.retries {
            attempts += 1;
            let pause = self
                .retry_sleeps
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or_default();
            debug!(
                call_id = %payload.call_id,
                attempt = attempts,
                pause_ms = pause.as_millis() as u64,
                "Invocation not accepted, retrying"
            );
            tokio::time::sleep(pause).await;
            handle = self.attempt(runtime_name, memory, payload).await;
        }

        if handle.is_none() {
            warn!(
                call_id = %payload.call_id,
                runtime = runtime_name,
                attempts = attempts,
                "Invocation gave no handle"
            );
        }
        handle
    }

    /// Dispatch a payload once and return the runtime's answer.
    pub async fn invoke_with_result(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> Result<(Option<InvocationHandle>, Value)> {
        Ok(self
            .backend
            .invoke_with_result(runtime_name, memory, payload)
            .await?)
    }

    /// Deploy a runtime.
    pub async fn create_runtime(
        &self,
        runtime_name: &str,
        memory: u32,
        timeout: Duration,
    ) -> Result<RuntimeMeta> {
        Ok(self
            .backend
            .create_runtime(runtime_name, memory, timeout)
            .await?)
    }

    /// Build and publish a runtime image.
    pub async fn build_runtime(&self, runtime_name: &str, dockerfile: Option<&Path>) -> Result<()> {
        Ok(self.backend.build_runtime(runtime_name, dockerfile).await?)
    }

    /// Remove a runtime.
    pub async fn delete_runtime(&self, runtime_name: &str, memory: u32) -> Result<()> {
        Ok(self.backend.delete_runtime(runtime_name, memory).await?)
    }

    /// Remove every runtime.
    pub async fn delete_all_runtimes(&self) -> Result<()> {
        Ok(self.backend.delete_all_runtimes().await?)
    }

    /// Deployed runtimes.
    pub async fn list_runtimes(&self, runtime_name: Option<&str>) -> Result<Vec<RuntimeInfo>> {
        Ok(self.backend.list_runtimes(runtime_name).await?)
    }

    /// Key identifying a runtime.
    pub fn get_runtime_key(&self, runtime_name: &str, memory: u32) -> String {
        self.backend.get_runtime_key(runtime_name, memory)
    }

    /// Metadata of a deployed runtime.
    pub async fn generate_runtime_meta(&self, runtime_name: &str, memory: u32) -> Result<RuntimeMeta> {
        Ok(self
            .backend
            .generate_runtime_meta(runtime_name, memory)
            .await?)
    }
}

static GLOBAL_CACHE: Lazy<ComputeCache> = Lazy::new(ComputeCache::new);

/// One shared [`Compute`] per configuration.
pub struct ComputeCache {
    registry: BackendRegistry,
    instances: Mutex<HashMap<String, Arc<Compute>>>,
}

impl Default for ComputeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeCache {
    /// Cache over the built-in backends.
    pub fn new() -> Self {
        Self::with_registry(BackendRegistry::with_builtin())
    }

    /// Cache over the backends of `registry`.
    pub fn with_registry(registry: BackendRegistry) -> Self {
        Self {
            registry,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// The instance for `config`, creating it on first use.
    ///
    /// Creation happens under the cache lock, so concurrent first callers
    /// get the same instance.
    pub fn get_or_create(&self, config: &ComputeConfig) -> Result<Arc<Compute>> {
        let key = config.cache_key()?;
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(compute) = instances.get(&key) {
            return Ok(Arc::clone(compute));
        }
        let compute = Arc::new(Compute::with_registry(config, &self.registry)?);
        instances.insert(key, Arc::clone(&compute));
        Ok(compute)
    }

    /// Number of cached instances.
    pub fn len(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no instance was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MockBackend, MockOutcome};
    use serde_json::json;

    fn config(retries: u32) -> ComputeConfig {
        ComputeConfig {
            retries,
            retry_sleeps: vec![2],
            ..ComputeConfig::new("mock")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_on_first_attempt_does_not_sleep() {
        let mock = Arc::new(MockBackend::new());
        let compute = Compute::with_backend(&config(5), mock.clone()).unwrap();
        let start = tokio::time::Instant::now();

        let handle = compute
            .invoke("rt", 256, &InvokePayload::new("e", "j", "c"))
            .await;

        assert_eq!(handle, Some(InvocationHandle::new("ejc")));
        assert_eq!(mock.invocations(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_counts_as_absent() {
        let mock = Arc::new(MockBackend::with_outcomes([MockOutcome::Error]));
        let compute = Compute::with_backend(&config(3), mock.clone()).unwrap();

        let handle = compute
            .invoke("rt", 256, &InvokePayload::new("e", "j", "c"))
            .await;

        assert!(handle.is_some());
        assert_eq!(mock.invocations(), 2);
    }

    #[tokio::test]
    async fn test_delegation() {
        let mock = Arc::new(MockBackend::from_section(&json!({"preinstalls": ["serde"]})).unwrap());
        let compute = Compute::with_backend(&config(1), mock.clone()).unwrap();

        let meta = compute
            .create_runtime("img:1", 512, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(meta.preinstalls, vec!["serde"]);
        assert_eq!(compute.list_runtimes(None).await.unwrap().len(), 1);
        assert_eq!(compute.get_runtime_key("img:1", 512), "mock/img:1--512mb");
        assert_eq!(compute.backend_name(), "mock");

        compute.delete_all_runtimes().await.unwrap();
        assert!(compute.list_runtimes(None).await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ComputeConfig {
            retries: 0,
            ..ComputeConfig::new("mock")
        };
        assert!(Compute::new(&config).is_err());
    }
}
