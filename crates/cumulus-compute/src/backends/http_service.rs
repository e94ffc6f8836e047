// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP-service compute backend.
//!
//! Each runtime (image, memory) is deployed as one service on a control
//! plane API and invoked over HTTP through a shared ingress endpoint, with
//! the service's host in the `Host` header.
//!
//! # Control plane API
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `{api_url}/namespaces/{ns}/services` | List services (`{"items": [...]}`) |
//! | `POST` | `{api_url}/namespaces/{ns}/services` | Create a service |
//! | `GET` | `{api_url}/namespaces/{ns}/services/{name}` | Service with `status.url` and `status.conditions` |
//! | `DELETE` | `{api_url}/namespaces/{ns}/services/{name}` | Delete a service |
//!
//! A service is ready once every entry of `status.conditions` has
//! `"status": "True"`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HOST};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{
    BackendResult, ComputeBackend, InvocationHandle, InvokePayload, RuntimeInfo, RuntimeMeta,
};
use crate::error::BackendError;

fn default_namespace() -> String {
    "default".to_string()
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_ready_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    600
}

/// Configuration section of the HTTP-service backend.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServiceConfig {
    /// Base URL of the control plane API
    pub api_url: Url,
    /// Namespace services are deployed into
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Ingress endpoint; learned from the first created service when absent
    #[serde(default)]
    pub endpoint: Option<Url>,
    /// Registry prefix for runtime images
    #[serde(default)]
    pub docker_repo: Option<String>,
    /// Bearer token for the control plane API
    #[serde(default)]
    pub api_token: Option<String>,
    /// Container CLI used by `build_runtime`
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,
    /// How long `create_runtime` waits for readiness
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Delay between readiness polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Timeout of a single HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl HttpServiceConfig {
    /// Configuration with defaults for everything but the API URL.
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            namespace: default_namespace(),
            endpoint: None,
            docker_repo: None,
            api_token: None,
            docker_bin: default_docker_bin(),
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Service name of a runtime.
///
/// Inside the image name `-` becomes `-h`, `/` becomes `-s` and `:` becomes
/// `-c`, so the encoded image never contains `--`. The memory tier follows
/// after `--`. `cumulus/runtime:0.3` with 256 MB is
/// `cumulus-sruntime-c0.3--256mb`.
pub fn format_service_name(runtime_name: &str, memory: u32) -> String {
    let mut name = String::with_capacity(runtime_name.len() + 12);
    for c in runtime_name.chars() {
        match c {
            '-' => name.push_str("-h"),
            '/' => name.push_str("-s"),
            ':' => name.push_str("-c"),
            c => name.push(c),
        }
    }
    format!("{}--{}mb", name, memory)
}

/// Exact inverse of [`format_service_name`]. Names it cannot have produced
/// are `None`.
pub fn unformat_service_name(service_name: &str) -> Option<(String, u32)> {
    let (encoded, memory) = service_name.rsplit_once("--")?;
    let memory = memory.strip_suffix("mb")?.parse().ok()?;

    let mut image = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();
    while let Some(c) = chars.next() {
        if c != '-' {
            image.push(c);
            continue;
        }
        match chars.next()? {
            'h' => image.push('-'),
            's' => image.push('/'),
            'c' => image.push(':'),
            _ => return None,
        }
    }
    Some((image, memory))
}

fn host_of(service_url: &str) -> String {
    service_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}

fn is_ready(service: &Value) -> bool {
    match service
        .pointer("/status/conditions")
        .and_then(Value::as_array)
    {
        Some(conditions) if !conditions.is_empty() => conditions
            .iter()
            .all(|c| c.get("status").and_then(Value::as_str) == Some("True")),
        _ => false,
    }
}

fn service_url_of(service: &Value) -> Option<&str> {
    service.pointer("/status/url").and_then(Value::as_str)
}

/// Backend deploying runtimes as HTTP services.
pub struct HttpServiceBackend {
    config: HttpServiceConfig,
    client: reqwest::Client,
    endpoint: RwLock<Option<Url>>,
    service_hosts: Mutex<HashMap<String, String>>,
}

impl HttpServiceBackend {
    /// Registry name.
    pub const NAME: &'static str = "http_service";

    /// Create the backend and its HTTP client.
    pub fn new(config: HttpServiceConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        info!(
            api_url = %config.api_url,
            endpoint = ?config.endpoint.as_ref().map(Url::as_str),
            namespace = %config.namespace,
            "HTTP-service backend initialized"
        );

        Ok(Self {
            endpoint: RwLock::new(config.endpoint.clone()),
            config,
            client,
            service_hosts: Mutex::new(HashMap::new()),
        })
    }

    /// Create the backend from its configuration section.
    pub fn from_section(section: &Value) -> BackendResult<Self> {
        let config: HttpServiceConfig = serde_json::from_value(section.clone())
            .map_err(|e| BackendError::Config(e.to_string()))?;
        Self::new(config)
    }

    /// Current ingress endpoint.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cached host of a service, if resolved before.
    pub fn cached_host(&self, service_name: &str) -> Option<String> {
        self.service_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_name)
            .cloned()
    }

    fn cache_host(&self, service_name: &str, host: String) {
        self.service_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service_name.to_string(), host);
    }

    fn services_url(&self) -> String {
        format!(
            "{}/namespaces/{}/services",
            self.config.api_url.as_str().trim_end_matches('/'),
            self.config.namespace
        )
    }

    fn service_url(&self, service_name: &str) -> String {
        format!("{}/{}", self.services_url(), service_name)
    }

    fn control(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch a service resource. A missing service is `None`.
    async fn get_service(&self, service_name: &str) -> BackendResult<Option<Value>> {
        let response = self
            .control(Method::GET, &self.service_url(service_name))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(BackendError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Host of a service, from the cache or the control plane.
    async fn service_host(&self, service_name: &str) -> BackendResult<String> {
        if let Some(host) = self.cached_host(service_name) {
            return Ok(host);
        }

        let service = self
            .get_service(service_name)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("service {}", service_name)))?;
        let url = service_url_of(&service).ok_or_else(|| {
            BackendError::InvalidResponse(format!("service {} has no status.url", service_name))
        })?;

        let host = host_of(url);
        debug!(service = service_name, host = %host, "Service host resolved");
        self.cache_host(service_name, host.clone());
        Ok(host)
    }

    /// Delete a service. A missing service is not an error.
    async fn delete_service(&self, service_name: &str) -> BackendResult<()> {
        let response = self
            .control(Method::DELETE, &self.service_url(service_name))
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(service = service_name, "Service not found, nothing to delete");
            }
            status if status.is_success() => {
                debug!(service = service_name, "Service deleted");
            }
            status => {
                return Err(BackendError::Status {
                    status: status.as_u16(),
                    body: response.text().await.unwrap_or_default(),
                });
            }
        }
        self.service_hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service_name);
        Ok(())
    }

    async fn create_service(
        &self,
        runtime_name: &str,
        memory: u32,
        timeout: Duration,
    ) -> BackendResult<()> {
        let service_name = format_service_name(runtime_name, memory);
        let image = match &self.config.docker_repo {
            Some(repo) => format!("{}/{}", repo.trim_end_matches('/'), runtime_name),
            None => runtime_name.to_string(),
        };
        let body = json!({
            "metadata": {
                "name": service_name,
                "labels": { "cumulus/runtime": "true" },
            },
            "spec": {
                "template": {
                    "spec": {
                        "timeoutSeconds": timeout.as_secs(),
                        "containers": [{
                            "image": image,
                            "resources": { "limits": { "memory": format!("{}Mi", memory) } },
                        }],
                    },
                },
            },
        });

        let response = self
            .control(Method::POST, &self.services_url())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!(service = %service_name, image = %image, "Service created");
        Ok(())
    }

    /// Poll a service until every condition is `True`. Returns its URL.
    async fn wait_ready(&self, service_name: &str) -> BackendResult<String> {
        let ready_timeout = Duration::from_secs(self.config.ready_timeout_secs);
        let deadline = Instant::now() + ready_timeout;

        loop {
            if let Some(service) = self.get_service(service_name).await? {
                if is_ready(&service) {
                    if let Some(url) = service_url_of(&service) {
                        return Ok(url.to_string());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Timeout(format!(
                    "service {} not ready after {} seconds",
                    service_name, self.config.ready_timeout_secs
                )));
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }

    /// POST a payload to a runtime's service.
    async fn post(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<(Option<InvocationHandle>, Value)> {
        let service_name = format_service_name(runtime_name, memory);
        let host = self.service_host(&service_name).await?;
        let endpoint = self
            .endpoint()
            .ok_or_else(|| BackendError::Config("no ingress endpoint configured".to_string()))?;
        let url = endpoint
            .join(payload.route())
            .map_err(|e| BackendError::Config(format!("invalid route {}: {}", payload.route(), e)))?;

        let start = Instant::now();
        let response = self
            .client
            .post(url)
            .header(HOST, host)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(payload)?)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        let roundtrip = start.elapsed();

        let data: Value = serde_json::from_slice(&body).map_err(|_| {
            BackendError::InvalidResponse(format!(
                "response from invocation is not JSON: {}",
                String::from_utf8_lossy(&body)
            ))
        })?;

        match status.as_u16() {
            200 | 202 => {
                debug!(
                    executor_id = %payload.executor_id,
                    call_id = %payload.call_id,
                    roundtrip_ms = roundtrip.as_millis() as u64,
                    "Invocation done"
                );
                Ok((Some(payload.handle()), data))
            }
            404 => Err(BackendError::NotFound(format!("service {}", service_name))),
            other => Err(BackendError::Status {
                status: other,
                body: data.to_string(),
            }),
        }
    }
}

async fn run_command(mut command: Command, description: String) -> BackendResult<()> {
    debug!(command = %description, "Running");
    let status = command.status().await?;
    if !status.success() {
        return Err(BackendError::Command {
            command: description,
            status: status.code(),
        });
    }
    Ok(())
}

#[async_trait]
impl ComputeBackend for HttpServiceBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<Option<InvocationHandle>> {
        Ok(self.post(runtime_name, memory, payload).await?.0)
    }

    async fn invoke_with_result(
        &self,
        runtime_name: &str,
        memory: u32,
        payload: &InvokePayload,
    ) -> BackendResult<(Option<InvocationHandle>, Value)> {
        self.post(runtime_name, memory, payload).await
    }

    async fn create_runtime(
        &self,
        runtime_name: &str,
        memory: u32,
        timeout: Duration,
    ) -> BackendResult<RuntimeMeta> {
        let service_name = format_service_name(runtime_name, memory);
        info!(service = %service_name, "Creating runtime");

        self.delete_service(&service_name).await?;
        self.create_service(runtime_name, memory, timeout).await?;
        let service_url = self.wait_ready(&service_name).await?;
        info!(service = %service_name, url = %service_url, "Runtime service ready");

        self.cache_host(&service_name, host_of(&service_url));
        {
            let mut endpoint = self
                .endpoint
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if endpoint.is_none() {
                match Url::parse(&service_url) {
                    Ok(url) => *endpoint = Some(url),
                    Err(e) => warn!(url = %service_url, error = %e, "Service URL is not a valid endpoint"),
                }
            }
        }

        self.generate_runtime_meta(runtime_name, memory).await
    }

    async fn build_runtime(
        &self,
        runtime_name: &str,
        dockerfile: Option<&Path>,
    ) -> BackendResult<()> {
        info!(image = runtime_name, "Building runtime image");

        let mut build = Command::new(&self.config.docker_bin);
        build.arg("build").arg("-t").arg(runtime_name);
        let mut description = format!("{} build -t {}", self.config.docker_bin, runtime_name);
        if let Some(dockerfile) = dockerfile {
            build.arg("-f").arg(dockerfile);
            description.push_str(&format!(" -f {}", dockerfile.display()));
        }
        build.arg(".");
        description.push_str(" .");
        run_command(build, description).await?;

        let mut push = Command::new(&self.config.docker_bin);
        push.arg("push").arg(runtime_name);
        run_command(
            push,
            format!("{} push {}", self.config.docker_bin, runtime_name),
        )
        .await?;

        info!(image = runtime_name, "Runtime image built and pushed");
        Ok(())
    }

    async fn delete_runtime(&self, runtime_name: &str, memory: u32) -> BackendResult<()> {
        let service_name = format_service_name(runtime_name, memory);
        info!(service = %service_name, "Deleting runtime");
        self.delete_service(&service_name).await
    }

    async fn delete_all_runtimes(&self) -> BackendResult<()> {
        for runtime in self.list_runtimes(None).await? {
            self.delete_runtime(&runtime.name, runtime.memory).await?;
        }
        Ok(())
    }

    async fn list_runtimes(&self, runtime_name: Option<&str>) -> BackendResult<Vec<RuntimeInfo>> {
        let response = self
            .control(Method::GET, &self.services_url())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let listing: Value = response.json().await?;
        let items = listing
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|item| item.pointer("/metadata/name").and_then(Value::as_str))
            .filter_map(unformat_service_name)
            .filter(|(name, _)| runtime_name.is_none_or(|wanted| name == wanted))
            .map(|(name, memory)| RuntimeInfo { name, memory })
            .collect())
    }

    fn get_runtime_key(&self, runtime_name: &str, memory: u32) -> String {
        let service_name = format_service_name(runtime_name, memory);
        let netloc = self.endpoint().and_then(|url| {
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        });
        match netloc {
            Some(netloc) => format!("{}/{}", netloc, service_name),
            None => service_name,
        }
    }

    async fn generate_runtime_meta(
        &self,
        runtime_name: &str,
        memory: u32,
    ) -> BackendResult<RuntimeMeta> {
        debug!(runtime = runtime_name, "Extracting preinstalls");
        let (_, data) = self
            .invoke_with_result(runtime_name, memory, &InvokePayload::for_route("/preinstalls"))
            .await?;
        RuntimeMeta::from_response(data)
    }
}
