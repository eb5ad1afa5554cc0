//! Thin REST client for the cloud inventory API.
//!
//! Keeps the wire shapes out of the rest of the plugin: everything above
//! this file deals in the types from the parent module. Transport
//! failures and rate limiting are retried here with jittered backoff;
//! logical errors are returned to the caller untouched.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};

use super::{
    CloudApi,
    CloudError,
    CloudSnapshot,
    CloudVolume,
    CreateVolumeParams,
    Instance,
    Region,
    StorageClass,
    VolumeState,
};
use crate::retry::Backoff;

/// Spacing enforced between consecutive API calls; the account-wide
/// request budget is shared with every other consumer of the token.
const REQUEST_SPACING: Duration = Duration::from_millis(200);

const API_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RestClient {
    http: Client,
    base: String,
    token: String,
    throttle: Mutex<Option<Instant>>,
}

impl RestClient {
    pub fn new(base: &str, token: &str) -> Result<RestClient, CloudError> {
        let http = Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|error| CloudError::Transport {
                message: error.to_string(),
                retryable: false,
            })?;

        Ok(RestClient {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            throttle: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn pace(&self) {
        let mut last = self.throttle.lock().await;
        if let Some(previous) = *last {
            let since = previous.elapsed();
            if since < REQUEST_SPACING {
                sleep(REQUEST_SPACING - since).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Issue a request, retrying transport-level failures with jittered
    /// backoff up to the retry budget.
    async fn send(
        &self,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> Result<Response, CloudError> {
        let mut backoff = Backoff::default();

        loop {
            self.pace().await;

            let request = build(&self.http).bearer_auth(&self.token);
            let error = match request.send().await {
                Ok(response) => match classify(response).await {
                    Ok(response) => return Ok(response),
                    Err(error) => error,
                },
                Err(error) => CloudError::Transport {
                    message: error.to_string(),
                    retryable: true,
                },
            };

            if !error.is_retryable() {
                return Err(error);
            }
            match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        "Cloud API call failed ({}), retrying in {:?}",
                        error, delay
                    );
                    sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, CloudError> {
        let response = self.send(|http| http.get(self.url(path))).await?;
        decode(response).await
    }
}

async fn classify(response: Response) -> Result<Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => CloudError::not_found("resource", ""),
        StatusCode::TOO_MANY_REQUESTS => CloudError::RateLimited,
        status if status.is_client_error() => CloudError::InvalidRequest {
            message: format!("{}: {}", status, body),
        },
        status => CloudError::Transport {
            message: format!("{}: {}", status, body),
            retryable: status.is_server_error(),
        },
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, CloudError> {
    response.json().await.map_err(|error| CloudError::Transport {
        message: format!("malformed API response: {}", error),
        retryable: false,
    })
}

#[derive(Deserialize)]
struct VolumeJson {
    id: String,
    label: String,
    #[serde(default)]
    mount_id: String,
    region: String,
    size_gb: u64,
    status: VolumeState,
    // Absent on volumes that predate the vfs storage class.
    #[serde(default)]
    storage_type: Option<StorageClass>,
    #[serde(default)]
    attached_instances: Vec<String>,
    #[serde(default)]
    attached_to_instance: Option<String>,
    #[serde(default)]
    fs_type: Option<String>,
}

impl From<VolumeJson> for CloudVolume {
    fn from(json: VolumeJson) -> CloudVolume {
        let attachments = if json.attached_instances.is_empty() {
            json.attached_to_instance.into_iter().collect()
        } else {
            json.attached_instances
        };

        CloudVolume {
            id: json.id,
            label: json.label,
            mount_label: json.mount_id,
            class: json.storage_type.unwrap_or(StorageClass::Block),
            region: json.region,
            size_gb: json.size_gb,
            attachments,
            state: json.status,
            filesystem_type: json.fs_type,
        }
    }
}

#[derive(Deserialize)]
struct VolumeBody {
    block: VolumeJson,
}

#[derive(Deserialize)]
struct VolumeListBody {
    blocks: Vec<VolumeJson>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Deserialize)]
struct SnapshotJson {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    source_volume_id: String,
    size_gb: u64,
    created_at: chrono::DateTime<chrono::Utc>,
    status: String,
}

impl From<SnapshotJson> for CloudSnapshot {
    fn from(json: SnapshotJson) -> CloudSnapshot {
        CloudSnapshot {
            id: json.id,
            label: json.label,
            source_volume_id: json.source_volume_id,
            size_gb: json.size_gb,
            created_at: json.created_at,
            ready: json.status == "complete",
        }
    }
}

#[derive(Deserialize)]
struct SnapshotBody {
    snapshot: SnapshotJson,
}

#[derive(Deserialize)]
struct SnapshotListBody {
    snapshots: Vec<SnapshotJson>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Deserialize)]
struct InstanceJson {
    id: String,
    region: String,
}

#[derive(Deserialize)]
struct InstanceBody {
    instance: InstanceJson,
}

#[derive(Deserialize)]
struct RegionJson {
    id: String,
}

#[derive(Deserialize)]
struct RegionListBody {
    regions: Vec<RegionJson>,
}

#[derive(Deserialize, Default)]
struct Meta {
    #[serde(default)]
    links: Links,
}

#[derive(Deserialize, Default)]
struct Links {
    #[serde(default)]
    next: String,
}

#[tonic::async_trait]
impl CloudApi for RestClient {
    async fn list_volumes(&self) -> Result<Vec<CloudVolume>, CloudError> {
        let mut volumes = Vec::new();
        let mut cursor = String::new();

        loop {
            let path = if cursor.is_empty() {
                "/blocks?per_page=500".to_string()
            } else {
                format!("/blocks?per_page=500&cursor={}", cursor)
            };
            let body: VolumeListBody = self.get_json(&path).await?;
            volumes.extend(body.blocks.into_iter().map(CloudVolume::from));
            cursor = body.meta.links.next;
            if cursor.is_empty() {
                return Ok(volumes);
            }
        }
    }

    async fn get_volume(&self, id: &str) -> Result<CloudVolume, CloudError> {
        let body: VolumeBody = self
            .get_json(&format!("/blocks/{}", id))
            .await
            .map_err(|error| error.for_resource("volume", id))?;
        Ok(body.block.into())
    }

    async fn create_volume(
        &self,
        params: CreateVolumeParams,
    ) -> Result<CloudVolume, CloudError> {
        let mut payload = serde_json::json!({
            "label": params.label,
            "region": params.region,
            "size_gb": params.size_gb,
            "storage_type": params.class,
        });
        if let Some(snapshot) = &params.source_snapshot {
            payload["snapshot_id"] = serde_json::json!(snapshot);
        }
        if let Some(volume) = &params.source_volume {
            payload["source_volume_id"] = serde_json::json!(volume);
        }

        let response = self
            .send(|http| http.post(self.url("/blocks")).json(&payload))
            .await?;
        let body: VolumeBody = decode(response).await?;
        Ok(body.block.into())
    }

    async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        self.send(|http| http.delete(self.url(&format!("/blocks/{}", id))))
            .await
            .map_err(|error| error.for_resource("volume", id))?;
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: &str,
        instance_id: &str,
    ) -> Result<(), CloudError> {
        let payload = serde_json::json!({ "instance_id": instance_id });
        self.send(|http| {
            http.post(self.url(&format!("/blocks/{}/attach", id)))
                .json(&payload)
        })
        .await
        .map_err(|error| error.for_resource("volume", id))?;
        Ok(())
    }

    async fn detach_volume(
        &self,
        id: &str,
        instance_id: &str,
    ) -> Result<(), CloudError> {
        let payload = serde_json::json!({ "instance_id": instance_id });
        self.send(|http| {
            http.post(self.url(&format!("/blocks/{}/detach", id)))
                .json(&payload)
        })
        .await
        .map_err(|error| error.for_resource("volume", id))?;
        Ok(())
    }

    async fn resize_volume(
        &self,
        id: &str,
        size_gb: u64,
    ) -> Result<(), CloudError> {
        let payload = serde_json::json!({ "size_gb": size_gb });
        self.send(|http| {
            http.patch(self.url(&format!("/blocks/{}", id))).json(&payload)
        })
        .await
        .map_err(|error| error.for_resource("volume", id))?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
    ) -> Result<Vec<CloudSnapshot>, CloudError> {
        let mut snapshots = Vec::new();
        let mut cursor = String::new();

        loop {
            let path = if cursor.is_empty() {
                "/snapshots?per_page=500".to_string()
            } else {
                format!("/snapshots?per_page=500&cursor={}", cursor)
            };
            let body: SnapshotListBody = self.get_json(&path).await?;
            snapshots
                .extend(body.snapshots.into_iter().map(CloudSnapshot::from));
            cursor = body.meta.links.next;
            if cursor.is_empty() {
                return Ok(snapshots);
            }
        }
    }

    async fn get_snapshot(
        &self,
        id: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        let body: SnapshotBody = self
            .get_json(&format!("/snapshots/{}", id))
            .await
            .map_err(|error| error.for_resource("snapshot", id))?;
        Ok(body.snapshot.into())
    }

    async fn create_snapshot(
        &self,
        source_volume_id: &str,
        label: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        let payload = serde_json::json!({
            "volume_id": source_volume_id,
            "label": label,
        });
        let response = self
            .send(|http| http.post(self.url("/snapshots")).json(&payload))
            .await
            .map_err(|error| {
                error.for_resource("volume", source_volume_id)
            })?;
        let body: SnapshotBody = decode(response).await?;
        Ok(body.snapshot.into())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<(), CloudError> {
        self.send(|http| {
            http.delete(self.url(&format!("/snapshots/{}", id)))
        })
        .await
        .map_err(|error| error.for_resource("snapshot", id))?;
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError> {
        let body: InstanceBody = self
            .get_json(&format!("/instances/{}", id))
            .await
            .map_err(|error| error.for_resource("instance", id))?;
        Ok(Instance {
            id: body.instance.id,
            region: body.instance.region,
        })
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CloudError> {
        let body: RegionListBody = self.get_json("/regions").await?;
        Ok(body
            .regions
            .into_iter()
            .map(|region| Region {
                id: region.id,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_volume_defaults_to_the_block_class() {
        let json: VolumeJson = serde_json::from_str(
            r#"{
                "id": "vol-1",
                "label": "pvc-1",
                "mount_id": "ewr-vol-1",
                "region": "ewr",
                "size_gb": 10,
                "status": "available",
                "attached_to_instance": "inst-1"
            }"#,
        )
        .unwrap();

        let volume = CloudVolume::from(json);
        assert_eq!(volume.class, StorageClass::Block);
        assert_eq!(volume.attachments, vec!["inst-1".to_string()]);
        assert_eq!(volume.state, VolumeState::Available);
    }

    #[test]
    fn vfs_volume_carries_multiple_attachments() {
        let json: VolumeJson = serde_json::from_str(
            r#"{
                "id": "vol-2",
                "label": "share-1",
                "mount_id": "ewr-share-1",
                "region": "ewr",
                "size_gb": 100,
                "status": "available",
                "storage_type": "vfs",
                "attached_instances": ["inst-1", "inst-2"]
            }"#,
        )
        .unwrap();

        let volume = CloudVolume::from(json);
        assert_eq!(volume.class, StorageClass::Vfs);
        assert_eq!(volume.attachments.len(), 2);
    }

    #[test]
    fn snapshot_readiness_follows_the_status_field() {
        let json: SnapshotJson = serde_json::from_str(
            r#"{
                "id": "snap-1",
                "label": "backup-1",
                "source_volume_id": "vol-1",
                "size_gb": 10,
                "created_at": "2021-06-01T12:00:00Z",
                "status": "complete"
            }"#,
        )
        .unwrap();

        let snapshot = CloudSnapshot::from(json);
        assert!(snapshot.ready);
        assert_eq!(snapshot.source_volume_id, "vol-1");
    }
}
