// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the worker HTTP entrypoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{Scripted, TestContext};
use cumulus_worker::server::{AppState, VERSION, create_router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

fn state(ctx: &TestContext) -> AppState {
    AppState {
        engine: ctx.inline_engine(Scripted::new(&[])),
        preinstalls: Arc::new(vec!["serde".to_string(), "tokio".to_string()]),
    }
}

async fn request(state: AppState, method: &str, path: &str, body: Value) -> (StatusCode, Value) {
    let app = create_router(state);

    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    (status, value)
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::new();
    let (status, body) = request(state(&ctx), "GET", "/health", Value::Null).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_preinstalls() {
    let ctx = TestContext::new();
    let (status, body) = request(state(&ctx), "POST", "/preinstalls", json!({})).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["preinstalls"], json!(["serde", "tokio"]));
    assert_eq!(body["version"], VERSION);
}

#[tokio::test]
async fn test_run_returns_report() {
    let ctx = TestContext::new();
    let job = ctx.job("C000", &[("00000", "in")], 1, 5).await;

    let (status, body) = request(
        state(&ctx),
        "POST",
        "/run",
        serde_json::to_value(&job).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_key"], "exec-C000");
    assert_eq!(body["statuses"][0]["call_id"], "00000");
    assert_eq!(body["statuses"][0]["result"]["input"], "in");
}

#[tokio::test]
async fn test_run_missing_payload_is_not_found() {
    let ctx = TestContext::new();
    let mut job = ctx.job("C001", &[("00000", "in")], 1, 5).await;
    job.func_key = "missing/func.bin".to_string();

    let (status, body) = request(
        state(&ctx),
        "POST",
        "/run",
        serde_json::to_value(&job).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "storage");
}

#[tokio::test]
async fn test_activation_runs_in_background() {
    let ctx = TestContext::new();
    let job = ctx.job("C002", &[("00000", "in")], 1, 5).await;

    let (status, body) = request(
        state(&ctx),
        "POST",
        "/",
        serde_json::to_value(&job).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["activation_id"].as_str().unwrap().len(), 32);

    let mut finished = Vec::new();
    for _ in 0..100 {
        finished = ctx.reporter.finished().await;
        if !finished.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].result().unwrap()["input"], "in");
}

#[tokio::test]
async fn test_activation_rejects_invalid_job() {
    let ctx = TestContext::new();
    let mut job = ctx.job("C003", &[("00000", "in")], 1, 5).await;
    job.data_byte_ranges.push((0, 1));

    let (status, body) = request(
        state(&ctx),
        "POST",
        "/",
        serde_json::to_value(&job).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_job");
    assert!(ctx.reporter.events().await.is_empty());
}
