//! Annotation form of a volume descriptor
//!
//! The cluster persists the provisioner's identity tags as string annotations
//! on the volume object. These helpers convert between that free-form map and
//! the typed fields on [`VolumeDescriptor`].

use crate::{BackendVolumeKey, Error, Result, VolumeDescriptor};
use std::collections::BTreeMap;

/// Identity of the provisioner instance that created the volume
pub const PROVISIONER_IDENTITY: &str = "isilonProvisionerIdentity";

/// Backend volume key the volume was created under
pub const BACKEND_VOLUME: &str = "isilonVolume";

impl VolumeDescriptor {
    /// Annotations to attach to the published volume object
    pub fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            PROVISIONER_IDENTITY.to_string(),
            self.provisioner_identity.clone(),
        );
        if let Some(ref key) = self.backend_volume_key {
            annotations.insert(BACKEND_VOLUME.to_string(), key.to_string());
        }
        annotations
    }

    /// Fill the identity tags from a volume object's annotations.
    ///
    /// A missing identity annotation is rejected outright; a missing volume
    /// annotation leaves `backend_volume_key` empty so deletion can report it
    /// as ignorable.
    pub fn apply_annotations(&mut self, annotations: &BTreeMap<String, String>) -> Result<()> {
        let identity = annotations.get(PROVISIONER_IDENTITY).ok_or_else(|| {
            Error::InvalidDescriptor("identity annotation not found on volume".to_string())
        })?;

        self.provisioner_identity = identity.clone();
        self.backend_volume_key = annotations
            .get(BACKEND_VOLUME)
            .filter(|v| !v.is_empty())
            .map(|v| BackendVolumeKey::from(v.as_str()));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReclaimPolicy;

    fn descriptor() -> VolumeDescriptor {
        VolumeDescriptor {
            name: "pvc-1".to_string(),
            server: "10.0.0.5".to_string(),
            path: "/ifs/k8s/ns-claim-pvc-1".to_string(),
            capacity_bytes: 1024,
            reclaim_policy: ReclaimPolicy::Delete,
            access_modes: vec![],
            provisioner_identity: "10.0.0.5".to_string(),
            backend_volume_key: Some(BackendVolumeKey::from("ns-claim-pvc-1")),
        }
    }

    #[test]
    fn test_annotations_carry_identity_and_key() {
        let annotations = descriptor().annotations();
        assert_eq!(annotations.get(PROVISIONER_IDENTITY).unwrap(), "10.0.0.5");
        assert_eq!(annotations.get(BACKEND_VOLUME).unwrap(), "ns-claim-pvc-1");
    }

    #[test]
    fn test_apply_annotations_restores_tags() {
        let original = descriptor();
        let mut restored = VolumeDescriptor {
            provisioner_identity: String::new(),
            backend_volume_key: None,
            ..original.clone()
        };
        restored.apply_annotations(&original.annotations()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_missing_identity_is_rejected() {
        let mut annotations = descriptor().annotations();
        annotations.remove(PROVISIONER_IDENTITY);

        let mut target = descriptor();
        let err = target.apply_annotations(&annotations).unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_missing_volume_leaves_key_empty() {
        let mut annotations = descriptor().annotations();
        annotations.remove(BACKEND_VOLUME);

        let mut target = descriptor();
        target.apply_annotations(&annotations).unwrap();
        assert!(target.backend_volume_key.is_none());
    }
}
