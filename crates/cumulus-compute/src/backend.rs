// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute backend contract.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BackendError;

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Opaque identifier of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationHandle(String);

impl InvocationHandle {
    /// Wrap a backend-specific identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Body of one dispatch.
///
/// The identifying fields are typed; the job body travels in `extra` and is
/// serialized flat next to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokePayload {
    /// Executor that submitted the job
    #[serde(default)]
    pub executor_id: String,
    /// Job identifier
    #[serde(default)]
    pub job_id: String,
    /// Task identifier
    #[serde(default)]
    pub call_id: String,
    /// Path to POST to on the runtime, `/` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_route: Option<String>,
    /// Remaining payload fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InvokePayload {
    /// Payload for one task.
    pub fn new(
        executor_id: impl Into<String>,
        job_id: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            job_id: job_id.into(),
            call_id: call_id.into(),
            ..Self::default()
        }
    }

    /// Payload addressed to a specific route, with no task identity.
    pub fn for_route(route: impl Into<String>) -> Self {
        Self {
            service_route: Some(route.into()),
            ..Self::default()
        }
    }

    /// Add a body field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Route to POST to.
    pub fn route(&self) -> &str {
        self.service_route.as_deref().unwrap_or("/")
    }

    /// Handle conventionally derived from the task identity.
    pub fn handle(&self) -> InvocationHandle {
        InvocationHandle(format!("{}{}{}", self.executor_id, self.job_id, self.call_id))
    }
}

/// A deployed runtime.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Runtime (image) name
    pub name: String,
    /// Memory tier in MB
    pub memory: u32,
}

/// Metadata describing what a runtime provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMeta {
    /// Packages installed in the runtime
    pub preinstalls: Vec<String>,
    /// Worker version running in the runtime
    #[serde(default)]
    pub version: Option<String>,
}

impl RuntimeMeta {
    /// Parse the `/preinstalls` answer of a worker.
    pub fn from_response(value: Value) -> BackendResult<Self> {
        if value.get("preinstalls").is_none() {
            return Err(BackendError::InvalidResponse(format!(
                "runtime metadata without preinstalls: {}",
                value
            )));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// A pluggable compute platform.
///
/// The dispatch layer relies on this capability set and nothing else.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Backend name, as used in configuration.
    fn name(&self) -> &str;

    /// Dispatch one payload. `Ok(None)` means the platform did not accept it.
    async fn invoke(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<Option<InvocationHandle>>;

    /// Dispatch one payload and return the runtime's answer.
    async fn invoke_with_result(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<(Option<InvocationHandle>, Value)>;

    /// Deploy a runtime and return its metadata.
    async fn create_runtime(
        &self,
        runtime_name: &str,
        memory: u32,
        timeout: Duration,
    ) -> BackendResult<RuntimeMeta>;

    /// Build (and publish) a runtime image.
    async fn build_runtime(&self, runtime_name: &str, dockerfile: Option<&Path>)
    -> BackendResult<()>;

    /// Remove a deployed runtime. Removing a missing runtime is not an error.
    async fn delete_runtime(&self, runtime_name: &str, memory: u32) -> BackendResult<()>;

    /// Remove every runtime this backend deployed.
    async fn delete_all_runtimes(&self) -> BackendResult<()>;

    /// Deployed runtimes, optionally only those of one runtime name.
    async fn list_runtimes(&self, runtime_name: Option<&str>) -> BackendResult<Vec<RuntimeInfo>>;

    /// Key identifying a runtime, used to store its metadata.
    fn get_runtime_key(&self, runtime_name: &str, memory: u32) -> String;

    /// Query a deployed runtime for its metadata.
    async fn generate_runtime_meta(&self, runtime_name: &str, memory: u32)
    -> BackendResult<RuntimeMeta>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_is_flat() {
        let payload = InvokePayload::new("exec", "A000", "00001")
            .with_field("func_key", json!("exec/A000/func.bin"));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "executor_id": "exec",
                "job_id": "A000",
                "call_id": "00001",
                "func_key": "exec/A000/func.bin",
            })
        );

        let back: InvokePayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.route(), "/");
    }

    #[test]
    fn test_handle_from_identity() {
        let payload = InvokePayload::new("exec", "A000", "00001");
        assert_eq!(payload.handle().as_str(), "execA00000001");
    }

    #[test]
    fn test_runtime_meta_requires_preinstalls() {
        let meta =
            RuntimeMeta::from_response(json!({"preinstalls": ["serde"], "version": "0.3.0"}))
                .unwrap();
        assert_eq!(meta.preinstalls, vec!["serde"]);
        assert_eq!(meta.version.as_deref(), Some("0.3.0"));

        assert!(matches!(
            RuntimeMeta::from_response(json!({"error": "boom"})),
            Err(BackendError::InvalidResponse(_))
        ));
    }
}
