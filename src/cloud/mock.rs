//! Recording provider used by orchestrator tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CloudProvider, InstanceDescription, ProviderError, ProviderResult, ProviderStatus};

#[derive(Default)]
pub(crate) struct MockProvider {
    addresses: Vec<String>,
    next: AtomicUsize,
    running: Mutex<HashMap<String, String>>,
    creates: AtomicUsize,
    destroys: Mutex<Vec<String>>,
    fail_creates: AtomicUsize,
    fail_destroys: AtomicUsize,
}

impl MockProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Hand out these addresses (cycling) instead of synthetic ones
    pub(crate) fn with_addresses(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            ..Self::default()
        }
    }

    /// Instances that already exist before the orchestrator starts
    pub(crate) fn with_existing(self, ids: &[&str]) -> Self {
        {
            let mut running = self.running.lock();
            for id in ids {
                running.insert(id.to_string(), format!("{}.example:3128", id));
            }
        }
        self
    }

    pub(crate) fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_destroys(&self, n: usize) {
        self.fail_destroys.store(n, Ordering::SeqCst);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn destroy_calls(&self) -> Vec<String> {
        self.destroys.lock().clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_instance(&self) -> ProviderResult<String> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_creates) {
            return Err(ProviderError::Api("injected create failure".to_string()));
        }

        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        let address = if self.addresses.is_empty() {
            format!("10.0.0.{}:3128", idx + 1)
        } else {
            self.addresses[idx % self.addresses.len()].clone()
        };
        let id = format!("mock-{}", n);
        self.running.lock().insert(id.clone(), address);
        Ok(id)
    }

    async fn destroy_instance(&self, id: &str) -> ProviderResult<()> {
        self.destroys.lock().push(id.to_string());
        if Self::take_failure(&self.fail_destroys) {
            return Err(ProviderError::Api("injected destroy failure".to_string()));
        }
        self.running.lock().remove(id);
        Ok(())
    }

    async fn instance_status(&self, id: &str) -> ProviderResult<InstanceDescription> {
        Ok(match self.running.lock().get(id) {
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
        Ok(self.running.lock().keys().cloned().collect())
    }
}
