//! Quota policy
//!
//! Decides whether a new volume gets a hard quota and how large it is. The
//! quota is the requested capacity, byte for byte.

use isilon_common::{BackendVolumeKey, Error, QuotaSpec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaPolicyError {
    #[error("No storage size requested and quotas enabled for volume {0}")]
    InvalidCapacity(BackendVolumeKey),
}

impl From<QuotaPolicyError> for Error {
    fn from(err: QuotaPolicyError) -> Self {
        Error::QuotaConfiguration(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    enabled: bool,
}

impl QuotaPolicy {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Quota to apply to a volume of `capacity_bytes`, if any
    pub fn plan(
        &self,
        key: &BackendVolumeKey,
        capacity_bytes: u64,
    ) -> Result<Option<QuotaSpec>, QuotaPolicyError> {
        if !self.enabled {
            return Ok(None);
        }

        if capacity_bytes == 0 {
            return Err(QuotaPolicyError::InvalidCapacity(key.clone()));
        }

        Ok(Some(QuotaSpec {
            backend_volume_key: key.clone(),
            size_bytes: capacity_bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BackendVolumeKey {
        BackendVolumeKey::from("a-data-pv")
    }

    #[test]
    fn test_disabled_never_plans_quota() {
        let policy = QuotaPolicy::new(false);
        assert_eq!(policy.plan(&key(), 0).unwrap(), None);
        assert_eq!(policy.plan(&key(), 1 << 30).unwrap(), None);
    }

    #[test]
    fn test_quota_equals_capacity() {
        let policy = QuotaPolicy::new(true);
        for size in [1, 1023, 5_000_000_000, u64::MAX] {
            let quota = policy.plan(&key(), size).unwrap().unwrap();
            assert_eq!(quota.size_bytes, size);
            assert_eq!(quota.backend_volume_key, key());
        }
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let policy = QuotaPolicy::new(true);
        let err = policy.plan(&key(), 0).unwrap_err();
        assert_eq!(err, QuotaPolicyError::InvalidCapacity(key()));
        assert!(matches!(Error::from(err), Error::QuotaConfiguration(_)));
    }
}
