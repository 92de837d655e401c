//! Object definitions shared by rk8s storage components.
//!
//! Objects are stored as YAML documents, one per key, the same way rks keeps
//! pods under `/registry/pods/<name>`. The store revision an object was read
//! at travels in [`ObjectMeta::resource_version`] and is never serialized.

mod lease;
mod quantity;
mod storage;

pub use lease::{Lease, LeaseSpec};
pub use quantity::parse_quantity;
pub use storage::{
    AccessMode, NfsVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, PersistentVolumeStatus, ReclaimPolicy,
    ResourceRequirements, StorageClass, VolumePhase, volume_name_for,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;

/// Annotation written on a claim once its volume exists.
pub const ANN_PROVISIONED_VOLUME: &str = "rkp.rk8s.io/provisioned-volume";
/// Annotation carrying the last terminal provisioning failure of a claim.
pub const ANN_PROVISIONING_FAILED: &str = "rkp.rk8s.io/provisioning-failed";
/// Annotation naming the provisioner that created a volume.
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Key holding the requested or provided storage size in resource maps.
pub const RESOURCE_STORAGE: &str = "storage";

#[derive(Debug, thiserror::Error)]
pub enum ObjectError {
    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),
    #[error("invalid reclaim policy {0:?}")]
    InvalidReclaimPolicy(String),
    #[error("unsupported access mode {0:?}")]
    InvalidAccessMode(String),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    /// Store modification revision this copy was read at. Zero for objects
    /// that were never stored.
    #[serde(skip)]
    pub resource_version: i64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A storable object kind.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Path segment the kind is stored under, e.g. `persistentvolumeclaims`.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    /// Decodes a stored value and stamps it with the revision it was read at.
    fn from_yaml(value: &str, revision: i64) -> Result<Self, ObjectError> {
        let mut obj: Self = serde_yaml::from_str(value)?;
        obj.metadata_mut().resource_version = revision;
        Ok(obj)
    }

    fn to_yaml(&self) -> Result<String, ObjectError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn default_api_version() -> String {
    "v1".to_string()
}
