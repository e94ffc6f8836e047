// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cumulus-compute integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use url::Url;
use wiremock::MockServer;

use cumulus_compute::backends::{HttpServiceBackend, HttpServiceConfig, MockBackend};
use cumulus_compute::{BackendRegistry, ComputeBackend, ComputeConfig};

/// Runtime used across HTTP backend tests.
pub const RUNTIME: &str = "cumulus/runtime:0.3";

/// Service name of [`RUNTIME`] at 256 MB.
pub const SERVICE: &str = "cumulus-sruntime-c0.3--256mb";

/// Control plane path prefix served by the mock server.
pub const API_PATH: &str = "/apis/v1/namespaces/default/services";

/// Backend configuration pointing both control plane and ingress at `server`.
pub fn http_config(server: &MockServer) -> HttpServiceConfig {
    let mut config =
        HttpServiceConfig::new(Url::parse(&format!("{}/apis/v1", server.uri())).unwrap());
    config.endpoint = Some(Url::parse(&server.uri()).unwrap());
    config.ready_timeout_secs = 2;
    config.poll_interval_ms = 10;
    config.request_timeout_secs = 5;
    config
}

/// Backend against `server`.
pub fn http_backend(server: &MockServer) -> HttpServiceBackend {
    HttpServiceBackend::new(http_config(server)).unwrap()
}

/// Service resource as returned by the control plane.
pub fn service(url: &str, ready: bool) -> Value {
    let status = if ready { "True" } else { "Unknown" };
    json!({
        "metadata": {"name": SERVICE},
        "status": {
            "url": url,
            "conditions": [
                {"type": "ConfigurationsReady", "status": "True"},
                {"type": "Ready", "status": status},
            ],
        },
    })
}

/// Dispatch configuration for the mock backend with a single backoff value.
pub fn retry_config(retries: u32, sleep_secs: u64) -> ComputeConfig {
    ComputeConfig {
        retries,
        retry_sleeps: vec![sleep_secs],
        ..ComputeConfig::new("mock")
    }
}

/// Registry with a `counting` backend that records how often it was built.
pub fn counting_registry() -> (BackendRegistry, Arc<AtomicUsize>) {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&created);
    let mut registry = BackendRegistry::empty();
    registry.register("counting", move |_section| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockBackend::new()) as Arc<dyn ComputeBackend>)
    });
    (registry, created)
}
