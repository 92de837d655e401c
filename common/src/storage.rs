use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::{Object, ObjectError, ObjectMeta, RESOURCE_STORAGE, default_api_version};

/// Name of the volume provisioned for a claim. Pure function of the claim
/// name, so re-provisioning after a crash lands on the same volume.
pub fn volume_name_for(claim_name: &str) -> String {
    format!("pv-{claim_name}")
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

impl FromStr for ReclaimPolicy {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Delete" => Ok(ReclaimPolicy::Delete),
            "Retain" => Ok(ReclaimPolicy::Retain),
            other => Err(ObjectError::InvalidReclaimPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReclaimPolicy::Delete => write!(f, "Delete"),
            ReclaimPolicy::Retain => write!(f, "Retain"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl FromStr for AccessMode {
    type Err = ObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Ok(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
            "ReadWriteOncePod" => Ok(AccessMode::ReadWriteOncePod),
            other => Err(ObjectError::InvalidAccessMode(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PersistentVolumeClaimSpec {
    #[serde(rename = "accessModes", default)]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(
        rename = "storageClassName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_class_name: Option<String>,
    /// Volume this claim is bound to, filled in by the provisioner.
    #[serde(rename = "volumeName", default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersistentVolumeClaim {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_claim_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeClaimSpec,
}

fn default_claim_kind() -> String {
    "PersistentVolumeClaim".to_string()
}

impl PersistentVolumeClaim {
    pub fn new(metadata: ObjectMeta, spec: PersistentVolumeClaimSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_claim_kind(),
            metadata,
            spec,
        }
    }

    /// Raw requested storage, e.g. `5Gi`.
    pub fn requested_storage(&self) -> Option<&str> {
        self.spec
            .resources
            .requests
            .get(RESOURCE_STORAGE)
            .map(String::as_str)
    }

    pub fn parsed_access_modes(&self) -> Result<Vec<AccessMode>, ObjectError> {
        self.spec
            .access_modes
            .iter()
            .map(|m| m.parse::<AccessMode>())
            .collect()
    }
}

impl Object for PersistentVolumeClaim {
    const KIND: &'static str = "persistentvolumeclaims";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StorageClass {
    #[serde(rename = "apiVersion", default = "default_storage_api_version")]
    pub api_version: String,
    #[serde(default = "default_class_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Name of the volume strategy serving this class.
    pub provisioner: String,
    /// Kept as text so a malformed value surfaces as a policy error on the
    /// claims using the class instead of making the class unreadable.
    #[serde(rename = "reclaimPolicy", default, skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<String>,
    #[serde(rename = "mountOptions", default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

fn default_storage_api_version() -> String {
    "storage.k8s.io/v1".to_string()
}

fn default_class_kind() -> String {
    "StorageClass".to_string()
}

impl StorageClass {
    pub fn new(name: &str, provisioner: &str, reclaim_policy: ReclaimPolicy) -> Self {
        Self {
            api_version: default_storage_api_version(),
            kind: default_class_kind(),
            metadata: ObjectMeta::named(name),
            provisioner: provisioner.to_string(),
            reclaim_policy: Some(reclaim_policy.to_string()),
            mount_options: Vec::new(),
            parameters: HashMap::new(),
        }
    }

    /// Effective reclaim policy; classes without one delete on release.
    pub fn reclaim_policy(&self) -> Result<ReclaimPolicy, ObjectError> {
        match self.reclaim_policy.as_deref() {
            None => Ok(ReclaimPolicy::default()),
            Some(p) => p.parse(),
        }
    }
}

impl Object for StorageClass {
    const KIND: &'static str = "storageclasses";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ObjectReference {
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

/// Location of an NFS backed volume.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NfsVolumeSource {
    pub server: String,
    pub path: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersistentVolumeSpec {
    #[serde(default)]
    pub capacity: HashMap<String, String>,
    #[serde(rename = "accessModes", default)]
    pub access_modes: Vec<String>,
    #[serde(rename = "persistentVolumeReclaimPolicy", default)]
    pub persistent_volume_reclaim_policy: ReclaimPolicy,
    #[serde(rename = "mountOptions", default, skip_serializing_if = "Vec::is_empty")]
    pub mount_options: Vec<String>,
    #[serde(
        rename = "storageClassName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_class_name: Option<String>,
    #[serde(rename = "claimRef", default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs: Option<NfsVolumeSource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumePhase {
    #[default]
    Pending,
    Bound,
    Released,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PersistentVolumeStatus {
    #[serde(default)]
    pub phase: VolumePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PersistentVolume {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_volume_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeSpec,
    #[serde(default)]
    pub status: PersistentVolumeStatus,
}

fn default_volume_kind() -> String {
    "PersistentVolume".to_string()
}

impl PersistentVolume {
    pub fn new(metadata: ObjectMeta, spec: PersistentVolumeSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_volume_kind(),
            metadata,
            spec,
            status: PersistentVolumeStatus::default(),
        }
    }

    pub fn claim_name(&self) -> Option<&str> {
        self.spec.claim_ref.as_ref().map(|r| r.name.as_str())
    }

    pub fn capacity(&self) -> Option<&str> {
        self.spec.capacity.get(RESOURCE_STORAGE).map(String::as_str)
    }
}

impl Object for PersistentVolume {
    const KIND: &'static str = "persistentvolumes";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_name_is_deterministic() {
        assert_eq!(volume_name_for("pvc-1"), "pv-pvc-1");
        assert_eq!(volume_name_for("pvc-1"), volume_name_for("pvc-1"));
        assert_ne!(volume_name_for("pvc-1"), volume_name_for("pvc-2"));
    }

    #[test]
    fn test_claim_yaml_round_trip_keeps_revision_out() {
        let yaml = r#"
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: pvc-1
  uid: 7d1c
spec:
  accessModes: [ReadWriteMany]
  resources:
    requests:
      storage: 5Gi
  storageClassName: standard
"#;
        let claim = PersistentVolumeClaim::from_yaml(yaml, 42).unwrap();
        assert_eq!(claim.metadata.resource_version, 42);
        assert_eq!(claim.requested_storage(), Some("5Gi"));
        assert_eq!(claim.spec.storage_class_name.as_deref(), Some("standard"));
        assert_eq!(
            claim.parsed_access_modes().unwrap(),
            vec![AccessMode::ReadWriteMany]
        );

        let out = claim.to_yaml().unwrap();
        assert!(!out.contains("resource_version"));
        assert!(!out.contains("resourceVersion"));
        let again = PersistentVolumeClaim::from_yaml(&out, 0).unwrap();
        assert_eq!(again.spec, claim.spec);
    }

    #[test]
    fn test_class_reclaim_policy() {
        let mut class = StorageClass::new("standard", "rk8s.io/nfs", ReclaimPolicy::Retain);
        assert_eq!(class.reclaim_policy().unwrap(), ReclaimPolicy::Retain);
        class.reclaim_policy = None;
        assert_eq!(class.reclaim_policy().unwrap(), ReclaimPolicy::Delete);
        class.reclaim_policy = Some("Recycle".to_string());
        assert!(class.reclaim_policy().is_err());
    }

    #[test]
    fn test_unknown_access_mode_rejected() {
        let mut claim = PersistentVolumeClaim::new(
            ObjectMeta::named("pvc-x"),
            PersistentVolumeClaimSpec::default(),
        );
        claim.spec.access_modes = vec!["ReadWriteSometimes".to_string()];
        assert!(claim.parsed_access_modes().is_err());
    }
}
