use serde::{Deserialize, Serialize};

use super::InstanceKey;

/// A routable proxy endpoint: the address of one `READY` instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Backend {
    pub key: InstanceKey,
    /// `host:port` of the instance's proxy process
    pub address: String,
}

impl Backend {
    pub fn new(key: InstanceKey, address: impl Into<String>) -> Self {
        Self {
            key,
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.address, self.key)
    }
}
