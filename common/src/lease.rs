use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Object, ObjectMeta};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LeaseSpec {
    #[serde(rename = "holderIdentity", default, skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    #[serde(rename = "leaseDurationMillis", default)]
    pub lease_duration_millis: i64,
    #[serde(rename = "acquireTime", default, skip_serializing_if = "Option::is_none")]
    pub acquire_time: Option<DateTime<Utc>>,
    #[serde(rename = "renewTime", default, skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    #[serde(rename = "leaseTransitions", default)]
    pub lease_transitions: i64,
}

/// Leader election record. One per elected component.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Lease {
    #[serde(rename = "apiVersion", default = "default_lease_api_version")]
    pub api_version: String,
    #[serde(default = "default_lease_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LeaseSpec,
}

fn default_lease_api_version() -> String {
    "coordination.k8s.io/v1".to_string()
}

fn default_lease_kind() -> String {
    "Lease".to_string()
}

impl Lease {
    pub fn new(name: &str, spec: LeaseSpec) -> Self {
        Self {
            api_version: default_lease_api_version(),
            kind: default_lease_kind(),
            metadata: ObjectMeta::named(name),
            spec,
        }
    }

    pub fn holder(&self) -> Option<&str> {
        self.spec.holder_identity.as_deref()
    }

    /// A lease without holder or renew time is free. Otherwise it is expired
    /// once `renewTime + leaseDurationMillis` lies before `now`. A duration
    /// too large to represent never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.holder(), self.spec.renew_time) {
            (None, _) | (_, None) => true,
            (Some(_), Some(renewed)) => {
                Duration::try_milliseconds(self.spec.lease_duration_millis)
                    .and_then(|d| renewed.checked_add_signed(d))
                    .is_some_and(|expiry| expiry < now)
            }
        }
    }
}

impl Object for Lease {
    const KIND: &'static str = "leases";

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
    fn test_lease_expiry() {
        let now = Utc::now();
        let mut lease = Lease::new(
            "rkp-leader",
            LeaseSpec {
                holder_identity: Some("a".to_string()),
                lease_duration_millis: 15_000,
                renew_time: Some(now - Duration::seconds(10)),
                ..Default::default()
            },
        );
        assert!(!lease.is_expired(now));

        lease.spec.renew_time = Some(now - Duration::seconds(16));
        assert!(lease.is_expired(now));

        lease.spec.holder_identity = None;
        lease.spec.renew_time = Some(now);
        assert!(lease.is_expired(now));
    }

    #[test]
    fn test_huge_duration_does_not_expire() {
        let now = Utc::now();
        let lease = Lease::new(
            "rkp-leader",
            LeaseSpec {
                holder_identity: Some("a".to_string()),
                lease_duration_millis: i64::MAX,
                renew_time: Some(now - Duration::days(365)),
                ..Default::default()
            },
        );
        assert!(!lease.is_expired(now));
    }
}
