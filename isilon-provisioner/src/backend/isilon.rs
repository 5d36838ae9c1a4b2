//! OneFS platform API client
//!
//! Volumes are directories under the configured export root, created through
//! the RESTful namespace API. Exports and quotas go through the platform API.

use super::{BackendClient, BackendError, BackendResult};
use crate::config::IsilonConfig;
use isilon_common::{BackendVolumeKey, QuotaSpec};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EXPORTS_PATH: &str = "/platform/1/protocols/nfs/exports";
const QUOTAS_PATH: &str = "/platform/1/quota/quotas";
const TARGET_TYPE_HEADER: &str = "x-isi-ifs-target-type";
const ACCESS_CONTROL_HEADER: &str = "x-isi-ifs-access-control";

#[derive(Debug, Deserialize)]
struct ExportList {
    #[serde(default)]
    exports: Vec<Export>,
}

#[derive(Debug, Deserialize)]
struct Export {
    id: u64,
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateExport<'a> {
    paths: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QuotaList {
    #[serde(default)]
    quotas: Vec<Quota>,
}

#[derive(Debug, Deserialize)]
struct Quota {
    id: String,
    path: String,
    #[serde(rename = "type")]
    quota_type: String,
    #[serde(default)]
    thresholds: Thresholds,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hard: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CreateQuota<'a> {
    path: &'a str,
    #[serde(rename = "type")]
    quota_type: &'static str,
    include_snapshots: bool,
    thresholds_include_overhead: bool,
    enforced: bool,
    thresholds: Thresholds,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// OneFS REST client
#[derive(Clone)]
pub struct IsilonClient {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    group: Option<String>,
    export_root: String,
}

impl IsilonClient {
    /// Build a client for the appliance described by `config`
    pub fn new(config: &IsilonConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint(),
            user: config.user.clone(),
            password: config.password.clone(),
            group: config.group.clone().filter(|g| !g.is_empty()),
            export_root: config.export_root.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Absolute `/ifs/...` path of a volume
    pub fn volume_path(&self, key: &BackendVolumeKey) -> String {
        format!("{}/{}", self.export_root, key)
    }

    fn namespace_url(&self, key: &BackendVolumeKey) -> String {
        format!("{}/namespace{}", self.endpoint, self.volume_path(key))
    }

    fn platform_url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    /// Send a request, racing it against the cancellation token
    async fn send(&self, request: RequestBuilder, cancel: &CancellationToken) -> BackendResult<Response> {
        let request = request.basic_auth(&self.user, Some(&self.password));

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            result = request.send() => result.map_err(|e| {
                BackendError::Unavailable(format!("Request to {} failed: {}", self.endpoint, e))
            })?,
        };

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            text = response.text() => text.unwrap_or_default(),
        };
        Err(classify(status, &body))
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> BackendResult<T> {
        let response = self.send(request, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            parsed = response.json::<T>() => parsed.map_err(|e| {
                BackendError::Unavailable(format!("Invalid response from appliance: {}", e))
            }),
        }
    }

    async fn find_exports(&self, path: &str, cancel: &CancellationToken) -> BackendResult<Vec<u64>> {
        let list: ExportList = self
            .json(self.client.get(self.platform_url(EXPORTS_PATH)), cancel)
            .await?;

        Ok(list
            .exports
            .into_iter()
            .filter(|e| e.paths.iter().any(|p| p.trim_end_matches('/') == path))
            .map(|e| e.id)
            .collect())
    }

    async fn find_quota(&self, path: &str, cancel: &CancellationToken) -> BackendResult<Option<Quota>> {
        let url = format!(
            "{}?path={}&type=directory",
            self.platform_url(QUOTAS_PATH),
            urlencoding::encode(path)
        );
        let list: QuotaList = self.json(self.client.get(url), cancel).await?;

        Ok(list
            .quotas
            .into_iter()
            .find(|q| q.quota_type == "directory" && q.path.trim_end_matches('/') == path))
    }

    async fn set_group(&self, key: &BackendVolumeKey, group: &str, cancel: &CancellationToken) -> BackendResult<()> {
        let body = serde_json::json!({
            "authoritative": "mode",
            "action": "update",
            "group": { "name": group, "type": "group" },
        });
        let url = format!("{}?acl", self.namespace_url(key));
        self.send(self.client.put(url).json(&body), cancel).await?;
        Ok(())
    }
}

/// Advisory and soft-only quotas carry no hard threshold and report zero
fn quota_spec(key: &BackendVolumeKey, quota: &Quota) -> QuotaSpec {
    QuotaSpec {
        backend_volume_key: key.clone(),
        size_bytes: quota.thresholds.hard.unwrap_or(0),
    }
}

/// Map an appliance error response onto the backend taxonomy
fn classify(status: StatusCode, body: &str) -> BackendError {
    let errors: ApiErrors = serde_json::from_str(body).unwrap_or_default();
    let message = errors
        .errors
        .iter()
        .map(|e| e.message.as_str())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    let message = if message.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, message)
    };

    let exists = errors
        .errors
        .iter()
        .any(|e| e.code == "AEC_EXISTS" || e.code == "AEC_CONFLICT");

    if status == StatusCode::NOT_FOUND {
        BackendError::NotFound(message)
    } else if status == StatusCode::CONFLICT || exists {
        BackendError::AlreadyExists(message)
    } else if status.is_client_error() {
        BackendError::Rejected(message)
    } else {
        BackendError::Unavailable(message)
    }
}

#[async_trait::async_trait]
impl BackendClient for IsilonClient {
    fn name(&self) -> &'static str {
        "isilon"
    }

    async fn create_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken) -> BackendResult<()> {
        info!(volume = %key, path = %self.volume_path(key), "Creating volume");

        // Without overwrite=false the namespace API silently accepts an existing directory
        let url = format!("{}?overwrite=false", self.namespace_url(key));
        let request = self
            .client
            .put(url)
            .header(TARGET_TYPE_HEADER, "container")
            .header(ACCESS_CONTROL_HEADER, "0777");
        self.send(request, cancel).await?;

        if let Some(ref group) = self.group {
            if let Err(e) = self.set_group(key, group, cancel).await {
                // A failed create leaves nothing behind for the caller to undo
                warn!(volume = %key, group = %group, error = %e, "Setting group failed, removing volume");
                let url = format!("{}?recursive=true", self.namespace_url(key));
                if let Err(cleanup) = self.send(self.client.delete(url), &CancellationToken::new()).await {
                    warn!(volume = %key, error = %cleanup, "Failed to remove volume after group error");
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn delete_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken) -> BackendResult<()> {
        info!(volume = %key, "Deleting volume");

        let url = format!("{}?recursive=true", self.namespace_url(key));
        self.send(self.client.delete(url), cancel).await?;
        Ok(())
    }

    async fn set_quota(&self, key: &BackendVolumeKey, size_bytes: u64, cancel: &CancellationToken) -> BackendResult<()> {
        info!(volume = %key, size_bytes, "Setting quota");

        let path = self.volume_path(key);
        let body = CreateQuota {
            path: &path,
            quota_type: "directory",
            include_snapshots: false,
            thresholds_include_overhead: false,
            enforced: true,
            thresholds: Thresholds {
                hard: Some(size_bytes),
            },
        };
        self.send(self.client.post(self.platform_url(QUOTAS_PATH)).json(&body), cancel)
            .await?;
        Ok(())
    }

    async fn clear_quota(&self, key: &BackendVolumeKey, cancel: &CancellationToken) -> BackendResult<()> {
        let path = self.volume_path(key);
        let quota = self
            .find_quota(&path, cancel)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("quota on {}", path)))?;

        info!(volume = %key, quota_id = %quota.id, "Clearing quota");
        let url = format!("{}/{}", self.platform_url(QUOTAS_PATH), quota.id);
        self.send(self.client.delete(url), cancel).await?;
        Ok(())
    }

    async fn get_quota(&self, key: &BackendVolumeKey, cancel: &CancellationToken) -> BackendResult<Option<QuotaSpec>> {
        let path = self.volume_path(key);
        let quota = self.find_quota(&path, cancel).await?;
        debug!(volume = %key, found = quota.is_some(), "Looked up quota");

        Ok(quota.map(|q| quota_spec(key, &q)))
    }

    async fn export_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken) -> BackendResult<()> {
        let path = self.volume_path(key);
        if !self.find_exports(&path, cancel).await?.is_empty() {
            return Err(BackendError::AlreadyExists(format!("export for {}", path)));
        }

        info!(volume = %key, path = %path, "Exporting volume");
        let body = CreateExport { paths: vec![&path] };
        self.send(self.client.post(self.platform_url(EXPORTS_PATH)).json(&body), cancel)
            .await?;
        Ok(())
    }

    async fn unexport_volume(&self, key: &BackendVolumeKey, cancel: &CancellationToken) -> BackendResult<()> {
        let path = self.volume_path(key);
        let ids = self.find_exports(&path, cancel).await?;
        if ids.is_empty() {
            return Err(BackendError::NotFound(format!("export for {}", path)));
        }

        for id in ids {
            info!(volume = %key, export_id = id, "Removing export");
            let url = format!("{}/{}", self.platform_url(EXPORTS_PATH), id);
            self.send(self.client.delete(url), cancel).await?;
        }
        Ok(())
    }
}
