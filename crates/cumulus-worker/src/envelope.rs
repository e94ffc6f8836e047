// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serializable error envelope.
//!
//! Errors cross the worker/child boundary as JSON: children write one under
//! the `exception` stats key, and the engine stores engine-side failures
//! under `exc_info` in the call status.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Structured error that survives a process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error kind (e.g. `timeout`, `out_of_memory`, `io`, or a user type name)
    pub kind: String,
    /// Top-level message
    pub message: String,
    /// Messages of the source chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
    /// Stack frames, when a backtrace was captured
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frames: Vec<String>,
}

impl ErrorEnvelope {
    /// Create an envelope without causes or frames.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            causes: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Capture an error, its source chain, and the current backtrace.
    ///
    /// Frames are only filled when backtraces are enabled
    /// (`RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`).
    pub fn capture(kind: impl Into<String>, error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            kind: kind.into(),
            message: error.to_string(),
            causes,
            frames: backtrace_frames(&Backtrace::capture()),
        }
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, "\n  caused by: {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorEnvelope {}

fn backtrace_frames(backtrace: &Backtrace) -> Vec<String> {
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    backtrace
        .to_string()
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_capture_source_chain() {
        let err = Outer(std::io::Error::other("disk gone"));
        let envelope = ErrorEnvelope::capture("io", &err);

        assert_eq!(envelope.kind, "io");
        assert_eq!(envelope.message, "outer failure");
        assert_eq!(envelope.causes, vec!["disk gone".to_string()]);
    }

    #[test]
    fn test_json_shape() {
        let envelope = ErrorEnvelope::new("timeout", "too slow");
        let json = serde_json::to_value(&envelope).unwrap();

        // Empty causes/frames are omitted
        assert_eq!(json, serde_json::json!({"kind": "timeout", "message": "too slow"}));

        let back: ErrorEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_display_includes_causes() {
        let envelope = ErrorEnvelope {
            causes: vec!["root".into()],
            ..ErrorEnvelope::new("io", "outer")
        };
        assert_eq!(envelope.to_string(), "io: outer\n  caused by: root");
    }
}
