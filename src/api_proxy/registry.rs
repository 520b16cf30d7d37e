//! Model Registry
//!
//! Flat lookup table from proxy-facing model name to the provider that serves it.
//! A registry is built once from a validated snapshot and never mutated; the
//! config store swaps whole registries on commit.

use std::collections::HashMap;
use std::sync::Arc;

use super::config::{ConfigSnapshot, ProviderConfig};
use super::error::{ApiError, ApiResult};

/// Resolved destination for one client-facing model name
#[derive(Debug, Clone)]
pub struct Route {
    pub provider: Arc<ProviderConfig>,
    pub upstream_model: String,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    routes: HashMap<String, Route>,
    /// Proxy-facing names in snapshot order, for listing
    names: Vec<String>,
}

impl ModelRegistry {
    /// Build the table for a snapshot. Fails on duplicate proxy-facing names.
    pub fn build(snapshot: &ConfigSnapshot) -> ApiResult<Self> {
        let mut registry = Self::default();

        for provider in &snapshot.providers {
            let shared = Arc::new(provider.clone());
            for mapping in &provider.models {
                let route = Route {
                    provider: Arc::clone(&shared),
                    upstream_model: mapping.upstream_name.clone(),
                };
                if registry
                    .routes
                    .insert(mapping.proxy_name.clone(), route)
                    .is_some()
                {
                    return Err(ApiError::config(format!(
                        "model name '{}' is mapped more than once",
                        mapping.proxy_name
                    )));
                }
                registry.names.push(mapping.proxy_name.clone());
            }
        }

        Ok(registry)
    }

    pub fn resolve(&self, model: &str) -> ApiResult<Route> {
        self.routes
            .get(model)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(model.to_string()))
    }

    pub fn model_names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
