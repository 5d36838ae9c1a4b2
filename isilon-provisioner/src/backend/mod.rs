//! Storage appliance backends
//!
//! The provisioning engine only talks to the appliance through
//! [`BackendClient`]. `isilon` is the OneFS platform API client used in
//! production; `memory` keeps everything in process for tests and dry runs.

pub mod isilon;
pub mod memory;

use isilon_common::{BackendVolumeKey, Error, QuotaSpec};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;

pub use isilon::IsilonClient;
pub use memory::MemoryBackend;

/// Errors reported by a backend primitive
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum BackendError {
    /// Transport failure, timeout or server-side error
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The appliance refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The object already exists under this key
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unavailable(msg) => Error::BackendUnavailable(msg),
            BackendError::Rejected(msg) => Error::BackendRejected(msg),
            BackendError::AlreadyExists(msg) => {
                Error::BackendRejected(format!("already exists: {}", msg))
            }
            BackendError::NotFound(msg) => Error::BackendRejected(format!("not found: {}", msg)),
            BackendError::Cancelled => Error::Cancelled,
        }
    }
}

/// Primitive operations on the storage appliance.
///
/// Every call takes the caller's cancellation token and must return
/// [`BackendError::Cancelled`] promptly once it fires.
#[async_trait::async_trait]
pub trait BackendClient: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Create the volume directory for `key`
    async fn create_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken)
        -> BackendResult<()>;

    /// Remove the volume directory and everything under it
    async fn delete_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken)
        -> BackendResult<()>;

    /// Apply a hard quota of `size_bytes` to the volume
    async fn set_quota(
        &self,
        key: &BackendVolumeKey,
        size_bytes: u64,
        cancel: &CancellationToken,
    ) -> BackendResult<()>;

    /// Remove the quota on the volume
    async fn clear_quota(&self, key: &BackendVolumeKey, cancel: &CancellationToken)
        -> BackendResult<()>;

    /// Look up the quota on the volume, if any.
    ///
    /// A quota without a hard limit (advisory or soft only) is reported with
    /// `size_bytes == 0`; provisioned quotas are never zero.
    async fn get_quota(
        &self,
        key: &BackendVolumeKey,
        cancel: &CancellationToken,
    ) -> BackendResult<Option<QuotaSpec>>;

    /// Publish the volume as an NFS export
    async fn export_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken)
        -> BackendResult<()>;

    /// Remove the NFS export for the volume
    async fn unexport_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken)
        -> BackendResult<()>;
}
