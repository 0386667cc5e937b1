// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Keyed catalog of provider adapters with concurrent health probes.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::BrokerError;

use super::Provider;

/// Health snapshot for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider_id: String,
    pub available: bool,
    /// Failure detail when unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Registry of adapters keyed by provider identifier.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: RwLock::new(HashMap::new()) }
    }

    /// Register an adapter under its identifier.
    pub async fn register(&self, provider: Arc<dyn Provider>) -> Result<(), BrokerError> {
        let mut providers = self.providers.write().await;
        let id = provider.id().to_owned();
        if providers.contains_key(&id) {
            return Err(BrokerError::already_exists(format!("provider {id} already registered")));
        }
        providers.insert(id, provider);
        Ok(())
    }

    /// Look up an adapter by identifier.
    pub async fn lookup(&self, id: &str) -> Result<Arc<dyn Provider>, BrokerError> {
        self.providers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::unavailable(format!("unknown provider {id}")))
    }

    /// Registered identifiers, in no particular order.
    pub async fn list(&self) -> Vec<String> {
        self.providers.read().await.keys().cloned().collect()
    }

    /// Probe every adapter concurrently. Individual failures are reported
    /// per entry, never as an aggregate error.
    pub async fn probe_all(&self) -> Vec<ProviderHealth> {
        let providers: Vec<Arc<dyn Provider>> =
            self.providers.read().await.values().cloned().collect();

        let probes = providers.into_iter().map(|provider| {
            tokio::task::spawn_blocking(move || {
                let health = provider.health();
                ProviderHealth {
                    provider_id: provider.id().to_owned(),
                    available: health.is_ok(),
                    detail: health.err().map(|e| e.message),
                    version: provider.version().map(str::to_owned),
                }
            })
        });

        join_all(probes)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok())
            .collect()
    }
}
