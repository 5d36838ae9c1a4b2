//! Common types shared between the provisioning engine, its backends and the CLI

pub mod annotations;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Volume access mode, named the way the cluster API spells it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            Self::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            Self::ReadWriteMany => write!(f, "ReadWriteMany"),
        }
    }
}

impl std::str::FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ReadWriteOnce" | "RWO" => Ok(Self::ReadWriteOnce),
            "ReadOnlyMany" | "ROX" => Ok(Self::ReadOnlyMany),
            "ReadWriteMany" | "RWX" => Ok(Self::ReadWriteMany),
            other => Err(Error::Validation(format!("Unknown access mode: {}", other))),
        }
    }
}

/// What the cluster does with the volume once its claim is released
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
    Recycle,
}

impl std::str::FromStr for ReclaimPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "delete" => Ok(Self::Delete),
            "retain" => Ok(Self::Retain),
            "recycle" => Ok(Self::Recycle),
            other => Err(Error::Validation(format!("Unknown reclaim policy: {}", other))),
        }
    }
}

/// A pending claim handed to the provisioner by the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeClaimRequest {
    pub namespace: String,
    pub claim_name: String,
    /// Name the controller picked for the persistent volume
    pub volume_name: String,
    /// Requested capacity in bytes; `None` or zero means unspecified
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

impl VolumeClaimRequest {
    /// Requested capacity, with "absent" folded into zero
    pub fn requested_capacity(&self) -> u64 {
        self.capacity_bytes.unwrap_or(0)
    }

    /// Derive the backend volume key for this claim
    pub fn backend_volume_key(&self) -> BackendVolumeKey {
        BackendVolumeKey::derive(&self.namespace, &self.claim_name, &self.volume_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Validation("Claim namespace cannot be empty".to_string()));
        }
        if self.claim_name.is_empty() {
            return Err(Error::Validation("Claim name cannot be empty".to_string()));
        }
        if self.volume_name.is_empty() {
            return Err(Error::Validation("Volume name cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Name of the backend volume backing one claim.
///
/// Always `{namespace}-{claim}-{volume}`, so a retried provision of the same
/// claim lands on the same backend object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendVolumeKey(String);

impl BackendVolumeKey {
    pub fn derive(namespace: &str, claim_name: &str, volume_name: &str) -> Self {
        Self([namespace, claim_name, volume_name].join("-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BackendVolumeKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BackendVolumeKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for BackendVolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hard directory quota on a backend volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSpec {
    pub backend_volume_key: BackendVolumeKey,
    pub size_bytes: u64,
}

/// The record the cluster persists for a provisioned volume and later hands
/// back for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    /// Cluster-visible volume name
    pub name: String,
    /// NFS server address
    pub server: String,
    /// NFS export path
    pub path: String,
    pub capacity_bytes: u64,
    pub reclaim_policy: ReclaimPolicy,
    pub access_modes: Vec<AccessMode>,
    /// Identity of the provisioner instance that created the volume
    pub provisioner_identity: String,
    /// Missing when the volume was never fully provisioned by us
    #[serde(default)]
    pub backend_volume_key: Option<BackendVolumeKey>,
}

impl VolumeDescriptor {
    /// Exact, case-sensitive identity check
    pub fn is_owned_by(&self, identity: &str) -> bool {
        self.provisioner_identity == identity
    }
}

/// Provisioner error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend rejected request: {0}")]
    BackendRejected(String),

    #[error("Quota configuration error: {0}")]
    QuotaConfiguration(String),

    #[error("Invalid volume descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Volume not owned by this provisioner (expected identity '{expected}', found '{found}')")]
    NotOwned { expected: String, found: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{cause}; rollback failed: {}", join_errors(.rollback))]
    RollbackFailed {
        cause: Box<Error>,
        rollback: Vec<Error>,
    },
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Outcomes the controller must neither retry nor alarm on
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::NotOwned { .. } | Error::InvalidDescriptor(_))
    }

    /// Whether retrying the same call unchanged may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::BackendUnavailable(_) | Error::Io(_) | Error::Cancelled => true,
            Error::RollbackFailed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// The error that started a failed sequence, looking through rollback wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RollbackFailed { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> VolumeClaimRequest {
        VolumeClaimRequest {
            namespace: "a".to_string(),
            claim_name: "data".to_string(),
            volume_name: "pvc-1234".to_string(),
            capacity_bytes: Some(5_000_000_000),
            access_modes: vec![AccessMode::ReadWriteMany],
            reclaim_policy: ReclaimPolicy::Delete,
        }
    }

    #[test]
    fn test_backend_volume_key_is_deterministic() {
        let req = request();
        assert_eq!(req.backend_volume_key().as_str(), "a-data-pvc-1234");
        assert_eq!(req.backend_volume_key(), req.clone().backend_volume_key());
    }

    #[test]
    fn test_request_validation() {
        assert!(request().validate().is_ok());

        let mut req = request();
        req.namespace.clear();
        assert!(matches!(req.validate(), Err(Error::Validation(_))));

        let mut req = request();
        req.claim_name.clear();
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_requested_capacity_absent_is_zero() {
        let mut req = request();
        req.capacity_bytes = None;
        assert_eq!(req.requested_capacity(), 0);
    }

    #[test]
    fn test_ownership_is_case_sensitive() {
        let descriptor = VolumeDescriptor {
            name: "pvc-1234".to_string(),
            server: "isilon.local".to_string(),
            path: "/ifs/k8s/a-data-pvc-1234".to_string(),
            capacity_bytes: 0,
            reclaim_policy: ReclaimPolicy::Delete,
            access_modes: vec![],
            provisioner_identity: "isilon.local".to_string(),
            backend_volume_key: None,
        };
        assert!(descriptor.is_owned_by("isilon.local"));
        assert!(!descriptor.is_owned_by("ISILON.local"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::NotOwned {
            expected: "a".to_string(),
            found: "b".to_string()
        }
        .is_ignorable());
        assert!(Error::InvalidDescriptor("missing key".to_string()).is_ignorable());
        assert!(!Error::BackendUnavailable("timeout".to_string()).is_ignorable());

        assert!(Error::BackendUnavailable("timeout".to_string()).is_retryable());
        assert!(!Error::BackendRejected("conflict".to_string()).is_retryable());
    }

    #[test]
    fn test_rollback_error_keeps_both_causes() {
        let err = Error::RollbackFailed {
            cause: Box::new(Error::BackendRejected("export refused".to_string())),
            rollback: vec![Error::BackendUnavailable("delete timed out".to_string())],
        };
        let message = err.to_string();
        assert!(message.contains("export refused"));
        assert!(message.contains("delete timed out"));
        assert!(matches!(err.root_cause(), Error::BackendRejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_descriptor_serializes_key_as_plain_string() {
        let descriptor = VolumeDescriptor {
            name: "pvc-1234".to_string(),
            server: "isilon.local".to_string(),
            path: "/ifs/k8s/a-data-pvc-1234".to_string(),
            capacity_bytes: 5_000_000_000,
            reclaim_policy: ReclaimPolicy::Retain,
            access_modes: vec![AccessMode::ReadWriteMany],
            provisioner_identity: "isilon.local".to_string(),
            backend_volume_key: Some(BackendVolumeKey::from("a-data-pvc-1234")),
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["backend_volume_key"], "a-data-pvc-1234");
        assert_eq!(json["access_modes"][0], "ReadWriteMany");

        let back: VolumeDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn test_request_defaults_when_fields_omitted() {
        let req: VolumeClaimRequest = serde_json::from_str(
            r#"{"namespace":"a","claim_name":"data","volume_name":"pvc-1"}"#,
        )
        .unwrap();
        assert_eq!(req.requested_capacity(), 0);
        assert!(req.access_modes.is_empty());
        assert_eq!(req.reclaim_policy, ReclaimPolicy::Delete);
    }

    #[test]
    fn test_access_mode_parsing() {
        assert_eq!("RWX".parse::<AccessMode>().unwrap(), AccessMode::ReadWriteMany);
        assert_eq!(
            "ReadOnlyMany".parse::<AccessMode>().unwrap(),
            AccessMode::ReadOnlyMany
        );
        assert!("rw".parse::<AccessMode>().is_err());
        assert_eq!("Retain".parse::<ReclaimPolicy>().unwrap(), ReclaimPolicy::Retain);
    }
}
