//! In-memory backend
//!
//! Mirrors the appliance's rules closely enough to catch ordering mistakes:
//! a volume cannot be deleted while it is exported or still carries a quota.
//! Every call is journaled, and faults can be queued per operation.

use super::{BackendClient, BackendError, BackendResult};
use isilon_common::{BackendVolumeKey, QuotaSpec};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backend primitive, as recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    CreateVolume,
    DeleteVolume,
    SetQuota,
    ClearQuota,
    GetQuota,
    Export,
    Unexport,
}

impl BackendOp {
    /// Whether the operation changes backend state
    pub fn is_mutation(&self) -> bool {
        !matches!(self, BackendOp::GetQuota)
    }
}

/// One journaled backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub op: BackendOp,
    pub key: BackendVolumeKey,
}

#[derive(Default)]
struct State {
    volumes: BTreeSet<BackendVolumeKey>,
    exports: BTreeSet<BackendVolumeKey>,
    quotas: BTreeMap<BackendVolumeKey, u64>,
    journal: Vec<BackendCall>,
    faults: HashMap<BackendOp, VecDeque<BackendError>>,
    hangs: HashSet<BackendOp>,
}

/// Backend that keeps volumes, exports and quotas in process memory
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`. Faults queue up per operation.
    pub async fn fail_next(&self, op: BackendOp, err: BackendError) {
        let mut state = self.state.write().await;
        state.faults.entry(op).or_default().push_back(err);
    }

    /// Make every call of `op` block until its cancellation token fires
    pub async fn hang_on(&self, op: BackendOp) {
        self.state.write().await.hangs.insert(op);
    }

    /// Stop blocking calls of `op`
    pub async fn release(&self, op: BackendOp) {
        self.state.write().await.hangs.remove(&op);
    }

    /// All calls made so far, in order
    pub async fn journal(&self) -> Vec<BackendCall> {
        self.state.read().await.journal.clone()
    }

    /// Operations made so far, in order
    pub async fn ops(&self) -> Vec<BackendOp> {
        self.state.read().await.journal.iter().map(|c| c.op).collect()
    }

    pub async fn clear_journal(&self) {
        self.state.write().await.journal.clear();
    }

    pub async fn volumes(&self) -> Vec<BackendVolumeKey> {
        self.state.read().await.volumes.iter().cloned().collect()
    }

    pub async fn exports(&self) -> Vec<BackendVolumeKey> {
        self.state.read().await.exports.iter().cloned().collect()
    }

    pub async fn quota(&self, key: &BackendVolumeKey) -> Option<u64> {
        self.state.read().await.quotas.get(key).copied()
    }

    /// True when no volume, export or quota exists
    pub async fn is_empty(&self) -> bool {
        let state = self.state.read().await;
        state.volumes.is_empty() && state.exports.is_empty() && state.quotas.is_empty()
    }

    /// Journal the call, then apply any hang or queued fault for it
    async fn enter(
        &self,
        op: BackendOp,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let (hang, fault) = {
            let mut state = self.state.write().await;
            state.journal.push(BackendCall {
                op,
                key: key.clone(),
            });
            let fault = state.faults.get_mut(&op).and_then(|q| q.pop_front());
            (state.hangs.contains(&op), fault)
        };

        debug!(backend = "memory", ?op, volume = %key, "Backend call");

        if hang {
            cancel.cancelled().await;
            return Err(BackendError::Cancelled);
        }

        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl BackendClient for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_volume(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.enter(BackendOp::CreateVolume, key, cancel).await?;
        let mut state = self.state.write().await;
        if !state.volumes.insert(key.clone()) {
            return Err(BackendError::AlreadyExists(format!("volume {}", key)));
        }
        Ok(())
    }

    async fn delete_volume(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.enter(BackendOp::DeleteVolume, key, cancel).await?;
        let mut state = self.state.write().await;
        if state.exports.contains(key) {
            return Err(BackendError::Rejected(format!("volume {} is still exported", key)));
        }
        if state.quotas.contains_key(key) {
            return Err(BackendError::Rejected(format!("volume {} still has a quota", key)));
        }
        if !state.volumes.remove(key) {
            return Err(BackendError::NotFound(format!("volume {}", key)));
        }
        Ok(())
    }

    async fn set_quota(
        &self,
        key: &BackendVolumeKey,
        size_bytes: u64,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.enter(BackendOp::SetQuota, key, cancel).await?;
        let mut state = self.state.write().await;
        if !state.volumes.contains(key) {
            return Err(BackendError::NotFound(format!("volume {}", key)));
        }
        if state.quotas.contains_key(key) {
            return Err(BackendError::AlreadyExists(format!("quota on {}", key)));
        }
        state.quotas.insert(key.clone(), size_bytes);
        Ok(())
    }

    async fn clear_quota(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.enter(BackendOp::ClearQuota, key, cancel).await?;
        let mut state = self.state.write().await;
        if state.quotas.remove(key).is_none() {
            return Err(BackendError::NotFound(format!("quota on {}", key)));
        }
        Ok(())
    }

    async fn get_quota(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<Option<QuotaSpec>> {
        self.enter(BackendOp::GetQuota, key, cancel).await?;
        let state = self.state.read().await;
        Ok(state.quotas.get(key).map(|size| QuotaSpec {
            backend_volume_key: key.clone(),
            size_bytes: *size,
        }))
    }

    async fn export_volume(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.enter(BackendOp::Export, key, cancel).await?;
        let mut state = self.state.write().await;
        if !state.volumes.contains(key) {
            return Err(BackendError::NotFound(format!("volume {}", key)));
        }
        if !state.exports.insert(key.clone()) {
            return Err(BackendError::AlreadyExists(format!("export for {}", key)));
        }
        Ok(())
    }

    async fn unexport_volume(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<()> {
        self.enter(BackendOp::Unexport, key, cancel).await?;
        let mut state = self.state.write().await;
        if !state.exports.remove(key) {
            return Err(BackendError::NotFound(format!("export for {}", key)));
        }
        Ok(())
    }
}
