//! Typed view of the cloud inventory API consumed by the controller.
//!
//! The controller state machine only ever talks to the `CloudApi` trait;
//! the REST implementation lives in `rest` and the integration tests
//! substitute an in-memory inventory. All calls are asynchronous and
//! cancel-safe: dropping the returned future leaves no client-side state
//! behind.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub mod rest;

use crate::GIB;

/// The two storage classes offered by the cloud: raw virtio disks and
/// virtio-fs shared filesystems.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Block,
    Vfs,
}

impl StorageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageClass::Block => "block",
            StorageClass::Vfs => "vfs",
        }
    }

    pub fn parse(value: &str) -> Option<StorageClass> {
        match value {
            "block" => Some(StorageClass::Block),
            "vfs" => Some(StorageClass::Vfs),
            _ => None,
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a volume as reported by the cloud. The inventory is
/// eventually consistent: callers poll for the state they need rather
/// than assuming transitions are immediate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Pending,
    Available,
    Attaching,
    Attached,
    Detaching,
    Resizing,
    Deleting,
}

/// A volume record from the cloud inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudVolume {
    pub id: String,
    /// User-facing name, unique per account by convention; the controller
    /// uses it for create idempotency.
    pub label: String,
    /// Stable identifier surfaced on the node: the virtio serial for
    /// block volumes, the share tag for vfs volumes.
    pub mount_label: String,
    pub class: StorageClass,
    pub region: String,
    /// The cloud speaks whole gigabytes; byte capacities are derived.
    pub size_gb: u64,
    /// Instances the volume is attached to. At most one entry for block
    /// volumes; any number for vfs volumes.
    pub attachments: Vec<String>,
    pub state: VolumeState,
    pub filesystem_type: Option<String>,
}

impl CloudVolume {
    pub fn capacity_bytes(&self) -> u64 {
        self.size_gb * GIB
    }

    pub fn attached_to(&self, instance_id: &str) -> bool {
        self.attachments.iter().any(|id| id == instance_id)
    }
}

/// A point-in-time snapshot of a block volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudSnapshot {
    pub id: String,
    pub label: String,
    pub source_volume_id: String,
    pub size_gb: u64,
    pub created_at: DateTime<Utc>,
    pub ready: bool,
}

/// A compute instance known to the cloud inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub region: String,
}

/// A region the cloud can provision volumes in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: String,
}

/// Request for provisioning a new volume.
#[derive(Debug, Clone, Default)]
pub struct CreateVolumeParams {
    pub label: String,
    pub region: String,
    pub size_gb: u64,
    pub class: StorageClass,
    /// Snapshot to hydrate the new volume from, if any.
    pub source_snapshot: Option<String>,
    /// Existing volume to clone, if any.
    pub source_volume: Option<String>,
}

impl Default for StorageClass {
    fn default() -> Self {
        StorageClass::Block
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum CloudError {
    #[snafu(display("{} {} not found", kind, id))]
    NotFound { kind: String, id: String },
    #[snafu(display("Invalid request to the cloud API: {}", message))]
    InvalidRequest { message: String },
    #[snafu(display("Cloud API rate limit exceeded"))]
    RateLimited,
    #[snafu(display("Cloud API transport failure: {}", message))]
    Transport { message: String, retryable: bool },
}

impl CloudError {
    pub fn not_found(kind: &str, id: &str) -> CloudError {
        CloudError::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// Retry hint for the transport layer. Logical failures are never
    /// retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::RateLimited => true,
            CloudError::Transport {
                retryable, ..
            } => *retryable,
            _ => false,
        }
    }

    /// Tag a bare not-found from the transport layer with the resource it
    /// actually refers to.
    pub fn for_resource(self, kind: &str, id: &str) -> CloudError {
        match self {
            CloudError::NotFound {
                ..
            } => CloudError::not_found(kind, id),
            other => other,
        }
    }
}

/// The cloud inventory operations the controller consumes. Rate limiting
/// and bounded retries on transport failures are the implementation's
/// responsibility; logical errors come back verbatim.
#[tonic::async_trait]
pub trait CloudApi: Send + Sync {
    async fn list_volumes(&self) -> Result<Vec<CloudVolume>, CloudError>;
    async fn get_volume(&self, id: &str) -> Result<CloudVolume, CloudError>;
    async fn create_volume(
        &self,
        params: CreateVolumeParams,
    ) -> Result<CloudVolume, CloudError>;
    async fn delete_volume(&self, id: &str) -> Result<(), CloudError>;
    async fn attach_volume(
        &self,
        id: &str,
        instance_id: &str,
    ) -> Result<(), CloudError>;
    async fn detach_volume(
        &self,
        id: &str,
        instance_id: &str,
    ) -> Result<(), CloudError>;
    async fn resize_volume(
        &self,
        id: &str,
        size_gb: u64,
    ) -> Result<(), CloudError>;
    async fn list_snapshots(&self)
        -> Result<Vec<CloudSnapshot>, CloudError>;
    async fn get_snapshot(
        &self,
        id: &str,
    ) -> Result<CloudSnapshot, CloudError>;
    async fn create_snapshot(
        &self,
        source_volume_id: &str,
        label: &str,
    ) -> Result<CloudSnapshot, CloudError>;
    async fn delete_snapshot(&self, id: &str) -> Result<(), CloudError>;
    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError>;
    async fn list_regions(&self) -> Result<Vec<Region>, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_class_round_trips_through_strings() {
        assert_eq!(StorageClass::parse("block"), Some(StorageClass::Block));
        assert_eq!(StorageClass::parse("vfs"), Some(StorageClass::Vfs));
        assert_eq!(StorageClass::parse("nvme"), None);
        assert_eq!(StorageClass::Vfs.as_str(), "vfs");
    }

    #[test]
    fn capacity_is_derived_from_gigabytes() {
        let volume = CloudVolume {
            id: "vol-1".into(),
            label: "pvc-1".into(),
            mount_label: "ewr-vol-1".into(),
            class: StorageClass::Block,
            region: "ewr".into(),
            size_gb: 10,
            attachments: vec![],
            state: VolumeState::Available,
            filesystem_type: None,
        };
        assert_eq!(volume.capacity_bytes(), 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn retry_hints() {
        assert!(CloudError::RateLimited.is_retryable());
        assert!(CloudError::Transport {
            message: "connection reset".into(),
            retryable: true,
        }
        .is_retryable());
        assert!(!CloudError::not_found("volume", "vol-1").is_retryable());
        assert!(!CloudError::InvalidRequest {
            message: "bad size".into(),
        }
        .is_retryable());
    }
}
