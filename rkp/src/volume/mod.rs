use async_trait::async_trait;
use common::{AccessMode, NfsVolumeSource, PersistentVolume, PersistentVolumeClaim, StorageClass};
use std::collections::HashMap;
use std::sync::Arc;

pub mod nfs;

pub use nfs::NfsStrategy;

/// Outcome class of a failed backend operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// Likely to succeed later without outside help.
    #[error("{0}")]
    Retryable(String),
    /// Will keep failing until someone changes the claim, class or backend.
    #[error("{0}")]
    Terminal(String),
}

impl ProvisionError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisionError::Terminal(_))
    }
}

/// Everything a strategy needs to create the backend resource of a claim.
#[derive(Debug, Clone)]
pub struct ProvisionRequest<'a> {
    /// Derived from the claim name, stable across retries.
    pub volume_name: &'a str,
    pub claim: &'a PersistentVolumeClaim,
    pub class: &'a StorageClass,
}

/// Backend location written into the volume object.
#[derive(Debug, Clone, PartialEq)]
pub enum VolumeSource {
    Nfs(NfsVolumeSource),
}

/// Backend policy for creating and destroying volumes.
///
/// Both operations must be idempotent: provisioning an already provisioned
/// volume returns its existing location, deleting a missing one succeeds.
#[async_trait]
pub trait VolumeStrategy: Send + Sync {
    /// Provisioner name storage classes refer to, e.g. `rk8s.io/nfs`.
    fn name(&self) -> &str;

    fn supports_access_mode(&self, mode: AccessMode) -> bool;

    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<VolumeSource, ProvisionError>;

    async fn delete(&self, volume: &PersistentVolume) -> Result<(), ProvisionError>;
}

/// Strategies served by this instance, keyed by provisioner name.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn VolumeStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn VolumeStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, provisioner: &str) -> Option<Arc<dyn VolumeStrategy>> {
        self.strategies.get(provisioner).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }
}
