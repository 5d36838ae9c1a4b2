//! Common test utilities and helpers

#![allow(dead_code)]

use isilon_common::{AccessMode, ReclaimPolicy, VolumeClaimRequest};
use isilon_provisioner::backend::MemoryBackend;
use isilon_provisioner::config::ProvisionerConfig;
use isilon_provisioner::Provisioner;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

pub const SERVER: &str = "isilon.example.com";
pub const EXPORT_ROOT: &str = "/ifs/data/k8s";

/// Test environment: a provisioner wired to an in-memory backend and a
/// scratch bookkeeping root
pub struct TestEnv {
    pub backend: MemoryBackend,
    pub provisioner: Arc<Provisioner>,
    pub mount_root: TempDir,
}

impl TestEnv {
    pub fn new(quota_enabled: bool) -> Self {
        let mount_root = tempfile::tempdir().expect("Failed to create mount root");
        let config = test_config(mount_root.path(), quota_enabled);
        let backend = MemoryBackend::new();
        let provisioner = Arc::new(Provisioner::new(&config, Arc::new(backend.clone())));

        TestEnv {
            backend,
            provisioner,
            mount_root,
        }
    }

    /// Build a second provisioner with a different identity on the same backend
    pub fn foreign(&self, identity: &str) -> Provisioner {
        let mut config = test_config(self.mount_root.path(), true);
        config.provisioner.identity = Some(identity.to_string());
        Provisioner::new(&config, Arc::new(self.backend.clone()))
    }
}

pub fn test_config(mount_root: &std::path::Path, quota_enabled: bool) -> ProvisionerConfig {
    let mut config = ProvisionerConfig::default();
    config.isilon.server = SERVER.to_string();
    config.isilon.export_root = EXPORT_ROOT.to_string();
    config.provisioner.quota_enabled = quota_enabled;
    config.provisioner.mount_root = Some(mount_root.to_path_buf());
    config
}

pub fn claim(namespace: &str, claim_name: &str, volume_name: &str, capacity: u64) -> VolumeClaimRequest {
    VolumeClaimRequest {
        namespace: namespace.to_string(),
        claim_name: claim_name.to_string(),
        volume_name: volume_name.to_string(),
        capacity_bytes: Some(capacity),
        access_modes: vec![AccessMode::ReadWriteMany],
        reclaim_policy: ReclaimPolicy::Delete,
    }
}

/// Poll until `check` holds or the attempts run out
pub async fn wait_until<F, Fut>(mut check: F, max_attempts: u32, delay_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..max_attempts {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(delay_ms)).await;
    }
    false
}
