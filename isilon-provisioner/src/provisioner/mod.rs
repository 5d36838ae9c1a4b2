//! Provisioning engine
//!
//! Turns volume claims into exported backend volumes and tears them down
//! again. Provision runs create volume → set quota → export → bookkeeping
//! directory, unwinding completed steps if a later one fails. Delete runs the
//! reverse: clear quota → unexport → delete volume.

pub mod rollback;

use crate::backend::{BackendClient, BackendError, BackendResult};
use crate::config::ProvisionerConfig;
use crate::log_volume_operation;
use crate::quota::QuotaPolicy;
use isilon_common::{
    BackendVolumeKey, Error, QuotaSpec, Result, VolumeClaimRequest, VolumeDescriptor,
};
use rollback::{UndoStack, UndoStep, CLEANUP_DEADLINE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Provisioner for volumes on a single appliance
pub struct Provisioner {
    /// Identity stamped on, and required of, every volume we manage
    identity: String,
    /// NFS server published in descriptors
    server: String,
    export_root: String,
    mount_root: PathBuf,
    quota: QuotaPolicy,
    backend: Arc<dyn BackendClient>,
}

impl Provisioner {
    pub fn new(config: &ProvisionerConfig, backend: Arc<dyn BackendClient>) -> Self {
        Self {
            identity: config.identity(),
            server: config.isilon.server.clone(),
            export_root: config.isilon.export_root.trim_end_matches('/').to_string(),
            mount_root: config.mount_root(),
            quota: QuotaPolicy::new(config.provisioner.quota_enabled),
            backend,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn quota_enabled(&self) -> bool {
        self.quota.enabled()
    }

    /// NFS export path of a volume
    pub fn export_path(&self, key: &BackendVolumeKey) -> String {
        format!("{}/{}", self.export_root, key)
    }

    /// Local bookkeeping directory of a volume
    pub fn bookkeeping_dir(&self, key: &BackendVolumeKey) -> PathBuf {
        self.mount_root.join(key.as_str())
    }

    /// Create a backend volume for `request` and describe how to mount it.
    ///
    /// Safe to call again for the same claim: objects that already exist
    /// under the claim's key are reused rather than duplicated.
    pub async fn provision(
        &self,
        request: &VolumeClaimRequest,
        cancel: &CancellationToken,
    ) -> Result<VolumeDescriptor> {
        request.validate()?;

        let key = request.backend_volume_key();
        let capacity = request.requested_capacity();
        info!(
            namespace = %request.namespace,
            claim = %request.claim_name,
            volume = %key,
            size_bytes = capacity,
            backend = self.backend.name(),
            "Provisioning volume"
        );

        // Pure check; a zero-size claim never reaches the backend
        let quota = self.quota.plan(&key, capacity)?;

        let mut undo = UndoStack::new(key.clone());
        match self.run_provision(request, &key, quota.as_ref(), &mut undo, cancel).await {
            Ok(descriptor) => {
                log_volume_operation!("provisioned", key, path = descriptor.path.as_str());
                Ok(descriptor)
            }
            Err(err) => Err(self.roll_back(err, undo).await),
        }
    }

    async fn run_provision(
        &self,
        request: &VolumeClaimRequest,
        key: &BackendVolumeKey,
        quota: Option<&QuotaSpec>,
        undo: &mut UndoStack,
        cancel: &CancellationToken,
    ) -> Result<VolumeDescriptor> {
        // Only objects created by this attempt are undone; reused ones may
        // already back a volume handed out earlier.
        match self.backend.create_volume(key, cancel).await {
            Ok(()) => {
                log_volume_operation!("create_volume", key);
                undo.push(UndoStep::DeleteVolume);
            }
            Err(BackendError::AlreadyExists(_)) => {
                info!(volume = %key, "Volume already exists, reusing it");
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(quota) = quota {
            if self.apply_quota(quota, cancel).await? {
                undo.push(UndoStep::ClearQuota);
            }
        }

        match self.backend.export_volume(key, cancel).await {
            Ok(()) => {
                log_volume_operation!("export", key);
                undo.push(UndoStep::Unexport);
            }
            Err(BackendError::AlreadyExists(_)) => {
                info!(volume = %key, "Export already exists, reusing it");
            }
            Err(e) => return Err(e.into()),
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let dir = self.bookkeeping_dir(key);
        ensure_dir(&dir).await?;

        Ok(VolumeDescriptor {
            name: request.volume_name.clone(),
            server: self.server.clone(),
            path: self.export_path(key),
            capacity_bytes: request.requested_capacity(),
            reclaim_policy: request.reclaim_policy,
            access_modes: request.access_modes.clone(),
            provisioner_identity: self.identity.clone(),
            backend_volume_key: Some(key.clone()),
        })
    }

    /// Set the quota, accepting an identical one left by an earlier attempt.
    /// Returns whether a new quota was created.
    async fn apply_quota(&self, quota: &QuotaSpec, cancel: &CancellationToken) -> Result<bool> {
        let key = &quota.backend_volume_key;
        match self.backend.set_quota(key, quota.size_bytes, cancel).await {
            Ok(()) => {
                log_volume_operation!("set_quota", key, size_bytes = quota.size_bytes);
                Ok(true)
            }
            Err(BackendError::AlreadyExists(_)) => {
                match self.backend.get_quota(key, cancel).await? {
                    Some(existing) if existing.size_bytes == 0 => {
                        Err(Error::BackendRejected(format!(
                            "volume {} already has a quota without a hard limit, requested {} bytes",
                            key, quota.size_bytes
                        )))
                    }
                    Some(existing) if existing.size_bytes != quota.size_bytes => {
                        Err(Error::BackendRejected(format!(
                            "volume {} already has a quota of {} bytes, requested {}",
                            key, existing.size_bytes, quota.size_bytes
                        )))
                    }
                    _ => {
                        info!(volume = %key, "Quota already set, reusing it");
                        Ok(false)
                    }
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Undo what a failed provision completed and fold rollback failures into the error
    async fn roll_back(&self, cause: Error, undo: UndoStack) -> Error {
        if undo.is_empty() {
            warn!(error = %cause, "Provisioning failed before any backend change");
            return cause;
        }

        warn!(error = %cause, steps = undo.steps().len(), "Provisioning failed, rolling back");
        let rollback = undo.unwind(self.backend.as_ref(), CLEANUP_DEADLINE).await;

        if rollback.is_empty() {
            cause
        } else {
            Error::RollbackFailed {
                cause: Box::new(cause),
                rollback,
            }
        }
    }

    /// Remove the backend volume described by `descriptor`.
    ///
    /// Returns [`Error::NotOwned`] for volumes stamped with another identity
    /// and [`Error::InvalidDescriptor`] when the backend key is missing; both
    /// are ignorable. Objects that are already gone are skipped, so a repeated
    /// delete succeeds.
    pub async fn delete(&self, descriptor: &VolumeDescriptor, cancel: &CancellationToken) -> Result<()> {
        if !descriptor.is_owned_by(&self.identity) {
            return Err(Error::NotOwned {
                expected: self.identity.clone(),
                found: descriptor.provisioner_identity.clone(),
            });
        }

        let key = descriptor.backend_volume_key.as_ref().ok_or_else(|| {
            Error::InvalidDescriptor(format!("no backend volume recorded for {}", descriptor.name))
        })?;

        info!(volume = %key, name = %descriptor.name, "Deleting volume");

        if self.quota.enabled() {
            if let Some(quota) = self.backend.get_quota(key, cancel).await? {
                absent_ok(self.backend.clear_quota(key, cancel).await, "clear_quota", key)?;
                log_volume_operation!("clear_quota", key, size_bytes = quota.size_bytes);
            }
        }

        absent_ok(self.backend.unexport_volume(key, cancel).await, "unexport", key)?;
        absent_ok(self.backend.delete_volume(key, cancel).await, "delete_volume", key)?;

        log_volume_operation!("deleted", key);
        Ok(())
    }
}

/// Treat "already gone" as done
fn absent_ok(result: BackendResult<()>, step: &str, key: &BackendVolumeKey) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(BackendError::NotFound(_)) => {
            info!(volume = %key, step, "Already absent");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Create-if-absent, world-writable like the exported directory itself
async fn ensure_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await?;
    }

    Ok(())
}
