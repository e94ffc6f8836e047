// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call status records and reporters.
//!
//! A [`CallStatus`] accumulates fields over one task's lifetime and is
//! flushed twice: an init event before the child is launched and a finish
//! event from the engine's finalization path.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::envelope::ErrorEnvelope;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::storage::ObjectStore;

/// Status lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    /// Emitted before execution starts
    Init,
    /// Emitted exactly once when the task is finalized
    Finish,
}

impl StatusEvent {
    /// Value of the `type` field for this event.
    pub fn type_tag(&self) -> &'static str {
        match self {
            StatusEvent::Init => "__init__",
            StatusEvent::Finish => "__end__",
        }
    }
}

/// Terminal failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The child outlived the execution timeout and was killed
    Timeout,
    /// The child exited without signaling completion
    OutOfMemory,
    /// The engine itself failed while supervising the task
    InternalError,
}

impl FailureKind {
    /// Stable string form, as stored in the `failure` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::OutOfMemory => "out_of_memory",
            FailureKind::InternalError => "internal_error",
        }
    }
}

/// Accumulated status of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallStatus {
    fields: Map<String, Value>,
}

impl CallStatus {
    /// Start a status record for `call_id` of `job`.
    pub fn new(job: &Job, call_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("executor_id".into(), Value::from(job.executor_id.clone()));
        fields.insert("job_id".into(), Value::from(job.job_id.clone()));
        fields.insert("job_key".into(), Value::from(job.job_key.clone()));
        fields.insert("call_id".into(), Value::from(call_id));
        fields.insert("worker_start_tstamp".into(), Value::from(unix_now()));
        Self { fields }
    }

    /// Set a field, replacing any previous value.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Get a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether a field is present.
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Field names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Task identifier.
    pub fn call_id(&self) -> &str {
        self.fields
            .get("call_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Record a terminal failure: sets `exception`, `exc_info` and `failure`.
    pub fn record_failure(&mut self, kind: FailureKind, envelope: &ErrorEnvelope) {
        self.add("exception", true);
        self.add(
            "exc_info",
            serde_json::to_value(envelope).unwrap_or(Value::Null),
        );
        self.add("failure", kind.as_str());
    }

    /// Failure classification, if the task failed on the engine side.
    pub fn failure(&self) -> Option<FailureKind> {
        match self.fields.get("failure").and_then(Value::as_str)? {
            "timeout" => Some(FailureKind::Timeout),
            "out_of_memory" => Some(FailureKind::OutOfMemory),
            "internal_error" => Some(FailureKind::InternalError),
            _ => None,
        }
    }

    /// Decoded `exc_info`, if present and well formed.
    pub fn exc_info(&self) -> Option<ErrorEnvelope> {
        serde_json::from_value(self.fields.get("exc_info")?.clone()).ok()
    }

    /// The `result` field, if the function produced one.
    pub fn result(&self) -> Option<&Value> {
        self.fields.get("result")
    }

    /// Serialize the record as it is sent for `event`.
    pub fn to_event_json(&self, event: StatusEvent) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("type".into(), Value::from(event.type_tag()));
        Value::Object(fields)
    }
}

/// Seconds since the Unix epoch, with sub-second precision.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Destination for call status events.
#[async_trait]
pub trait CallStatusReporter: Send + Sync {
    /// Deliver one lifecycle event for a task.
    async fn send(&self, event: StatusEvent, status: &CallStatus) -> Result<()>;
}

/// Reporter that writes status records into an object store.
///
/// Layout: `{prefix}/{job_key}/{call_id}/init.json` and `.../status.json`.
pub struct StoreReporter {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl StoreReporter {
    /// Create a reporter writing under `prefix`.
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Store key for an event of a task.
    pub fn key_for(&self, job_key: &str, call_id: &str, event: StatusEvent) -> String {
        let file = match event {
            StatusEvent::Init => "init.json",
            StatusEvent::Finish => "status.json",
        };
        format!("{}/{}/{}/{}", self.prefix, job_key, call_id, file)
    }
}

#[async_trait]
impl CallStatusReporter for StoreReporter {
    async fn send(&self, event: StatusEvent, status: &CallStatus) -> Result<()> {
        let job_key = status
            .get("job_key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Reporter("status has no job_key".to_string()))?;
        let key = self.key_for(job_key, status.call_id(), event);
        let body = serde_json::to_vec(&status.to_event_json(event))?;
        self.store.put(&key, Bytes::from(body)).await?;
        debug!(key = %key, event = ?event, "Call status stored");
        Ok(())
    }
}

/// Reporter that keeps every event in memory.
#[derive(Default)]
pub struct MockReporter {
    events: Mutex<Vec<(StatusEvent, CallStatus)>>,
    /// If true, every send fails (for testing reporter outages)
    pub fail_sends: bool,
}

impl MockReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a reporter whose sends always fail.
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    /// All events received so far, in order.
    pub async fn events(&self) -> Vec<(StatusEvent, CallStatus)> {
        self.events.lock().await.clone()
    }

    /// Finish records received so far.
    pub async fn finished(&self) -> Vec<CallStatus> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(event, _)| *event == StatusEvent::Finish)
            .map(|(_, status)| status.clone())
            .collect()
    }

    /// Events received for one call id, in order.
    pub async fn events_for(&self, call_id: &str) -> Vec<StatusEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|(_, status)| status.call_id() == call_id)
            .map(|(event, _)| *event)
            .collect()
    }
}

#[async_trait]
impl CallStatusReporter for MockReporter {
    async fn send(&self, event: StatusEvent, status: &CallStatus) -> Result<()> {
        if self.fail_sends {
            return Err(Error::Reporter("mock reporter failure".to_string()));
        }
        self.events.lock().await.push((event, status.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use serde_json::json;

    fn job() -> Job {
        serde_json::from_value(json!({
            "executor_id": "exec-1",
            "job_id": "A000",
            "job_key": "exec-1-A000",
            "call_ids": ["00000"],
            "func_key": "f",
            "data_key": "d",
            "data_byte_ranges": [[0, 0]],
            "execution_timeout": 10,
            "runtime_name": "rt",
        }))
        .unwrap()
    }

    #[test]
    fn test_new_status_fields() {
        let status = CallStatus::new(&job(), "00000");

        assert_eq!(status.call_id(), "00000");
        assert_eq!(status.get("executor_id"), Some(&json!("exec-1")));
        assert!(status.get("worker_start_tstamp").unwrap().as_f64().unwrap() > 0.0);
        assert!(status.failure().is_none());
    }

    #[test]
    fn test_record_failure() {
        let mut status = CallStatus::new(&job(), "00000");
        status.record_failure(
            FailureKind::Timeout,
            &ErrorEnvelope::new("timeout", "exceeded 10 seconds"),
        );

        assert_eq!(status.get("exception"), Some(&json!(true)));
        assert_eq!(status.failure(), Some(FailureKind::Timeout));
        assert_eq!(status.exc_info().unwrap().message, "exceeded 10 seconds");
    }

    #[test]
    fn test_event_json_carries_type() {
        let status = CallStatus::new(&job(), "00000");
        assert_eq!(status.to_event_json(StatusEvent::Init)["type"], "__init__");
        assert_eq!(status.to_event_json(StatusEvent::Finish)["type"], "__end__");
        assert!(!status.contains("type"));
    }

    #[tokio::test]
    async fn test_store_reporter_layout() {
        let store = Arc::new(MemoryObjectStore::new());
        let reporter = StoreReporter::new(store.clone(), "jobs");
        let status = CallStatus::new(&job(), "00000");

        reporter.send(StatusEvent::Init, &status).await.unwrap();
        reporter.send(StatusEvent::Finish, &status).await.unwrap();

        assert_eq!(
            store.keys("jobs/").await,
            vec![
                "jobs/exec-1-A000/00000/init.json".to_string(),
                "jobs/exec-1-A000/00000/status.json".to_string(),
            ]
        );

        let body = store.get("jobs/exec-1-A000/00000/status.json").await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "__end__");
    }

    #[tokio::test]
    async fn test_mock_reporter_records_order() {
        let reporter = MockReporter::new();
        let status = CallStatus::new(&job(), "00000");

        reporter.send(StatusEvent::Init, &status).await.unwrap();
        reporter.send(StatusEvent::Finish, &status).await.unwrap();

        assert_eq!(
            reporter.events_for("00000").await,
            vec![StatusEvent::Init, StatusEvent::Finish]
        );
        assert_eq!(reporter.finished().await.len(), 1);
    }
}
