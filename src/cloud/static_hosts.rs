//! Provider backed by a fixed list of already-running proxy hosts
//!
//! Each configured address can be claimed by at most one instance at a time.
//! Claims live in memory, so a restarted process starts with an empty fleet.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{CloudProvider, InstanceDescription, ProviderError, ProviderResult, ProviderStatus};

pub struct StaticProvider {
    addresses: Vec<String>,
    /// instance id -> claimed address
    claims: Mutex<HashMap<String, String>>,
}

impl StaticProvider {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            claims: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl CloudProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn create_instance(&self) -> ProviderResult<String> {
        let mut claims = self.claims.lock();

        let free = self
            .addresses
            .iter()
            .find(|addr| !claims.values().any(|claimed| claimed == *addr))
            .cloned()
            .ok_or_else(|| {
                ProviderError::QuotaExceeded(format!(
                    "all {} static hosts are in use",
                    self.addresses.len()
                ))
            })?;

        let id = format!("static-{}", Uuid::new_v4().simple());
        claims.insert(id.clone(), free.clone());
        debug!(
            instance = %id,
            address = %free,
            remaining = self.addresses.len() - claims.len(),
            "Claimed static host"
        );
        Ok(id)
    }

    async fn destroy_instance(&self, id: &str) -> ProviderResult<()> {
        if let Some(address) = self.claims.lock().remove(id) {
            debug!(instance = %id, address = %address, "Released static host");
        }
        Ok(())
    }

    async fn instance_status(&self, id: &str) -> ProviderResult<InstanceDescription> {
        let claims = self.claims.lock();
        Ok(match claims.get(id) {
            Some(address) => InstanceDescription {
                id: id.to_string(),
                status: ProviderStatus::Running,
                address: Some(address.clone()),
            },
            None => InstanceDescription {
                id: id.to_string(),
                status: ProviderStatus::Terminated,
                address: None,
            },
        })
    }

    async fn list_instances(&self) -> ProviderResult<Vec<String>> {
        Ok(self.claims.lock().keys().cloned().collect())
    }
}
