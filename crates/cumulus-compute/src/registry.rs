// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend selection by name.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::backends::{HttpServiceBackend, MockBackend};
use crate::error::{BackendError, ComputeError, Result};

/// Builds a backend from its configuration section.
pub type BackendConstructor =
    Box<dyn Fn(&Value) -> std::result::Result<Arc<dyn ComputeBackend>, BackendError> + Send + Sync>;

/// Maps backend names to constructors.
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl BackendRegistry {
    /// Registry without any backend.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with the backends shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(HttpServiceBackend::NAME, |section| {
            Ok(Arc::new(HttpServiceBackend::from_section(section)?) as Arc<dyn ComputeBackend>)
        });
        registry.register(MockBackend::NAME, |section| {
            Ok(Arc::new(MockBackend::from_section(section)?) as Arc<dyn ComputeBackend>)
        });
        registry
    }

    /// Register (or replace) a backend constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&Value) -> std::result::Result<Arc<dyn ComputeBackend>, BackendError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(name.into(), Box::new(constructor));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct the backend registered under `name`.
    pub fn create(&self, name: &str, section: &Value) -> Result<Arc<dyn ComputeBackend>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ComputeError::UnknownBackend(name.to_string()))?;
        debug!(backend = name, "Creating compute backend");
        constructor(section).map_err(|source| ComputeError::BackendInit {
            name: name.to_string(),
            source,
        })
    }
}
