// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation retry timing, on a paused clock.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use common::retry_config;
use cumulus_compute::backends::{MockBackend, MockOutcome};
use cumulus_compute::{Compute, ComputeConfig, InvocationHandle, InvokePayload};

fn payload() -> InvokePayload {
    InvokePayload::new("exec", "A000", "00001")
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_on_third_attempt_after_two_sleeps() {
    let mock = Arc::new(MockBackend::with_outcomes([
        MockOutcome::Absent,
        MockOutcome::Absent,
    ]));
    let compute = Compute::with_backend(&retry_config(3, 3), mock.clone()).unwrap();
    let start = Instant::now();

    let handle = compute.invoke("rt", 256, &payload()).await;

    assert_eq!(handle, Some(InvocationHandle::new("execA00000001")));
    assert_eq!(mock.invocations(), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_retries_attempts() {
    let mock = Arc::new(MockBackend::failing());
    let compute = Compute::with_backend(&retry_config(4, 1), mock.clone()).unwrap();
    let start = Instant::now();

    let handle = compute.invoke("rt", 256, &payload()).await;

    assert_eq!(handle, None);
    assert_eq!(mock.invocations(), 4);
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_single_absent_result_sleeps_once() {
    let mock = Arc::new(MockBackend::with_outcomes([MockOutcome::Absent]));
    let compute = Compute::with_backend(&retry_config(5, 10), mock.clone()).unwrap();
    let start = Instant::now();

    let handle = compute.invoke("rt", 256, &payload()).await;

    assert!(handle.is_some());
    assert_eq!(mock.invocations(), 2);
    assert_eq!(start.elapsed(), Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_retry_disabled_makes_one_attempt() {
    let mock = Arc::new(MockBackend::failing());
    let config = ComputeConfig {
        invocation_retry: false,
        ..retry_config(5, 1)
    };
    let compute = Compute::with_backend(&config, mock.clone()).unwrap();
    let start = Instant::now();

    assert_eq!(compute.invoke("rt", 256, &payload()).await, None);
    assert_eq!(mock.invocations(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_backend_errors_are_retried_like_absent_handles() {
    let mock = Arc::new(MockBackend::with_outcomes([
        MockOutcome::Error,
        MockOutcome::Absent,
        MockOutcome::Error,
    ]));
    let compute = Compute::with_backend(&retry_config(5, 2), mock.clone()).unwrap();
    let start = Instant::now();

    let handle = compute.invoke("rt", 256, &payload()).await;

    assert!(handle.is_some());
    assert_eq!(mock.invocations(), 4);
    assert_eq!(start.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_sleep_is_drawn_from_retry_sleeps() {
    let config = ComputeConfig {
        retries: 2,
        retry_sleeps: vec![1, 5],
        ..ComputeConfig::new("mock")
    };

    for _ in 0..8 {
        let mock = Arc::new(MockBackend::failing());
        let compute = Compute::with_backend(&config, mock).unwrap();
        let start = Instant::now();

        compute.invoke("rt", 256, &payload()).await;

        let elapsed = start.elapsed();
        assert!(
            elapsed == Duration::from_secs(1) || elapsed == Duration::from_secs(5),
            "unexpected backoff {:?}",
            elapsed
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_default_policy_allows_five_attempts() {
    let mock = Arc::new(MockBackend::failing());
    let compute = Compute::with_backend(&ComputeConfig::new("mock"), mock.clone()).unwrap();
    let start = Instant::now();

    assert_eq!(compute.invoke("rt", 256, &payload()).await, None);
    assert_eq!(mock.invocations(), 5);

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed <= Duration::from_secs(120));
}
