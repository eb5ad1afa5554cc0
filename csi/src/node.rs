//! Implementation of gRPC methods from the CSI Node service.
//!
//! All idempotency decisions are taken against the live kernel mount
//! table; the plugin holds no mount state of its own across RPCs.

use std::{fs, os::unix::fs::DirBuilderExt};

use tonic::{Code, Request, Response, Status};

use crate::{
    block_vol::stage_block_volume,
    cloud::StorageClass,
    context::PublishContext,
    csi::*,
    failure,
    locks::KeyedLocks,
    mount::{self, ReadOnly},
    vfs_vol::stage_vfs_volume,
    MAX_VOLS_PER_NODE,
    TOPOLOGY_REGION_KEY,
};

/// Mode of the staging and target directories the plugin creates.
const MOUNT_DIR_MODE: u32 = 0o750;

#[derive(Debug)]
pub struct Node {
    node_id: String,
    region: String,
    filesystems: Vec<String>,
    locks: KeyedLocks,
}

impl Node {
    pub fn new(node_id: String, region: String) -> Node {
        Node {
            node_id,
            region,
            filesystems: mount::probe_filesystems(),
            locks: KeyedLocks::new(),
        }
    }
}

fn create_mount_dir(path: &str) -> Result<(), std::io::Error> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(MOUNT_DIR_MODE)
        .create(path)
}

// Determine if the given access mode in conjunction with the ro mount
// flag makes sense. Access mode is advisory info for the CO when
// attaching volumes to pods; the only hard rule enforced here is that
// multi-node modes need the vfs class, since a block volume can only
// ever be attached to one node.
fn check_access_mode(
    volume_id: &str,
    access_mode: &Option<volume_capability::AccessMode>,
    class: StorageClass,
    readonly: bool,
) -> Result<(), String> {
    use crate::csi::volume_capability::access_mode::Mode;

    let mode = match access_mode {
        Some(wrapper) => Mode::from_i32(wrapper.mode).ok_or_else(|| {
            format!("Invalid access mode for volume {}", volume_id)
        })?,
        None => {
            return Err(format!("Missing access mode for {}", volume_id))
        }
    };

    let rdonly_access_mode = match mode {
        Mode::SingleNodeWriter => false,
        Mode::SingleNodeReaderOnly => true,
        Mode::MultiNodeReaderOnly => true,
        Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter => {
            if class == StorageClass::Block {
                return Err(format!(
                    "Unsupported access mode {:?} for block volume {}",
                    mode, volume_id
                ));
            }
            false
        }
        Mode::Unknown => {
            return Err(format!(
                "Unsupported access mode for volume {}",
                volume_id
            ));
        }
    };

    if !readonly && rdonly_access_mode {
        Err(format!(
            "Invalid combination of access mode and ro mount flag for {}",
            volume_id,
        ))
    } else {
        Ok(())
    }
}

#[tonic::async_trait]
impl node_server::Node for Node {
    /// Stage the volume to a node-scoped path: block class volumes are
    /// located by their virtio serial, formatted on first use and
    /// mounted; vfs class volumes are mounted by their share tag.
    /// This operation MUST be idempotent.
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        let volume_id = &msg.volume_id;
        let staging_path = &msg.staging_target_path;

        if volume_id.is_empty() || staging_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Invalid staging path or volume id"
            ));
        }

        let capability = msg.volume_capability.as_ref().ok_or_else(|| {
            failure!(
                Code::InvalidArgument,
                "No volume capabilities provided for {}",
                volume_id
            )
        })?;

        let mnt = match capability.access_type {
            Some(volume_capability::AccessType::Mount(ref m)) => m.clone(),
            Some(volume_capability::AccessType::Block(_)) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Raw block volumes are not supported"
                ));
            }
            None => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Missing access type for volume {}",
                    volume_id
                ));
            }
        };

        let context =
            PublishContext::parse(&msg.publish_context).map_err(|error| {
                failure!(
                    Code::InvalidArgument,
                    "Failed to stage volume {}: {}",
                    volume_id,
                    error
                )
            })?;

        // relax the check a bit by pretending all stage mounts are ro
        if let Err(reason) = check_access_mode(
            volume_id,
            &capability.access_mode,
            context.class,
            true,
        ) {
            return Err(failure!(Code::InvalidArgument, "{}", reason));
        }

        let _guard = self.locks.lock(staging_path).await;

        debug!("Staging volume {} to {}", volume_id, staging_path);

        if let Err(error) = create_mount_dir(staging_path) {
            return Err(failure!(
                Code::Internal,
                "Failed to create mountpoint {} for volume {}: {}",
                staging_path,
                volume_id,
                error
            ));
        }

        match context.class {
            StorageClass::Block => {
                stage_block_volume(
                    volume_id,
                    staging_path,
                    &context.mount_vol_name,
                    &mnt,
                    &self.filesystems,
                )
                .await?
            }
            StorageClass::Vfs => stage_vfs_volume(
                volume_id,
                staging_path,
                &context.mount_vol_name,
            )?,
        }

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    /// This operation MUST be idempotent. If the volume is not staged to
    /// the staging_target_path, the plugin MUST reply 0 OK.
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();
        let volume_id = &msg.volume_id;
        let staging_path = &msg.staging_target_path;

        if volume_id.is_empty() || staging_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Invalid staging path or volume id"
            ));
        }

        let _guard = self.locks.lock(staging_path).await;

        debug!("Unstaging volume {} at {}", volume_id, staging_path);

        if let Err(error) = mount::cleanup_mount_point(staging_path, true) {
            return Err(failure!(
                Code::Internal,
                "Failed to unstage volume {}: {}",
                volume_id,
                error
            ));
        }

        info!("Volume {} unstaged from {}", volume_id, staging_path);

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    /// Bind mount the staged volume into the pod-scoped target path.
    /// This operation MUST be idempotent: republishing the same source
    /// to the same target is a no-op, a different source on the target
    /// is a conflict.
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        let volume_id = &msg.volume_id;
        let staging_path = &msg.staging_target_path;
        let target_path = &msg.target_path;

        // The staging path is optional by the spec, but must be set when
        // the plugin advertises stage volume, which this one does.
        if staging_path.is_empty() || target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Invalid target or staging path for {}",
                volume_id
            ));
        }

        let capability = msg.volume_capability.as_ref().ok_or_else(|| {
            failure!(
                Code::InvalidArgument,
                "No volume capabilities provided for {}",
                volume_id
            )
        })?;

        let mnt = match capability.access_type {
            Some(volume_capability::AccessType::Mount(ref m)) => m,
            Some(volume_capability::AccessType::Block(_)) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Raw block volumes are not supported"
                ));
            }
            None => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Missing access type for {}",
                    volume_id
                ));
            }
        };

        let context =
            PublishContext::parse(&msg.publish_context).map_err(|error| {
                failure!(
                    Code::InvalidArgument,
                    "Failed to publish volume {}: {}",
                    volume_id,
                    error
                )
            })?;

        if let Err(reason) = check_access_mode(
            volume_id,
            &capability.access_mode,
            context.class,
            msg.readonly,
        ) {
            return Err(failure!(Code::InvalidArgument, "{}", reason));
        }

        let _guard = self.locks.lock(target_path).await;

        let staged = mount::find_mount(None, Some(staging_path))
            .ok_or_else(|| {
                failure!(
                    Code::InvalidArgument,
                    "No mount {} for volume {} (hint: volume unstaged?)",
                    staging_path,
                    volume_id
                )
            })?;

        if !mnt.fs_type.is_empty()
            && context.class == StorageClass::Block
            && mnt.fs_type != staged.fstype
        {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: filesystem type ({}) does not match staged volume ({})",
                volume_id,
                mnt.fs_type,
                staged.fstype
            ));
        }

        let staged_readonly = staged.options.readonly();

        if staged_readonly && !msg.readonly {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: volume is staged as \"ro\" but publish requires \"rw\"",
                volume_id
            ));
        }

        if let Some(bound) = mount::find_mount(None, Some(target_path)) {
            if bound.source != staged.source {
                return Err(failure!(
                    Code::AlreadyExists,
                    "Failed to publish volume {}: directory {} is already in use",
                    volume_id,
                    target_path
                ));
            }

            if !mount::subset(&mnt.mount_flags, &bound.options)
                || msg.readonly != bound.options.readonly()
            {
                return Err(failure!(
                    Code::AlreadyExists,
                    "Failed to publish volume {}: directory {} is already mounted but with incompatible flags",
                    volume_id,
                    target_path
                ));
            }

            info!(
                "Volume {} is already published to {}",
                volume_id, target_path
            );

            return Ok(Response::new(NodePublishVolumeResponse {}));
        }

        debug!("Creating directory {}", target_path);

        if let Err(error) = create_mount_dir(target_path) {
            return Err(failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to create directory {}: {}",
                volume_id,
                target_path,
                error
            ));
        }

        debug!("Mounting {} to {}", staging_path, target_path);

        if let Err(error) = mount::bind_mount(staging_path, target_path) {
            return Err(failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to mount {} to {}: {}",
                volume_id,
                staging_path,
                target_path,
                error
            ));
        }

        if msg.readonly && !staged_readonly {
            let mut options = mnt.mount_flags.clone();
            options.push(String::from("ro"));

            debug!("Remounting {} as readonly", target_path);

            if let Err(error) = mount::bind_remount(target_path, &options) {
                let message = format!(
                    "Failed to publish volume {}: failed to mount {} to {} as readonly: {}",
                    volume_id, staging_path, target_path, error
                );

                error!("Failed to remount {}: {}", target_path, error);

                debug!("Unmounting {}", target_path);

                if let Err(error) = mount::bind_unmount(target_path) {
                    error!("Failed to unmount {}: {}", target_path, error);
                }

                return Err(Status::new(Code::Internal, message));
            }
        }

        info!("Volume {} published to {}", volume_id, target_path);

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    /// This operation MUST be idempotent: an unpublished target is
    /// success.
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        let volume_id = &msg.volume_id;
        let target_path = &msg.target_path;

        if volume_id.is_empty() || target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Invalid target path or volume id"
            ));
        }

        let _guard = self.locks.lock(target_path).await;

        if mount::find_mount(None, Some(target_path)).is_some() {
            debug!("Unmounting volume {} at {}", volume_id, target_path);

            if let Err(error) = mount::bind_unmount(target_path) {
                return Err(failure!(
                    Code::Internal,
                    "Failed to unpublish volume {}: {}",
                    volume_id,
                    error
                ));
            }
        } else {
            debug!("Volume {} is not published at {}", volume_id, target_path);
        }

        if let Err(error) = fs::remove_dir(target_path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove directory {}: {}",
                    target_path, error
                );
            }
        }

        info!("Volume {} unpublished from {}", volume_id, target_path);

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        let volume_id = &msg.volume_id;
        let volume_path = &msg.volume_path;

        if volume_id.is_empty() || volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Invalid volume path or volume id"
            ));
        }

        if let Err(error) = fs::metadata(volume_path) {
            return if error.kind() == std::io::ErrorKind::NotFound {
                Err(failure!(
                    Code::NotFound,
                    "Volume {} has no path {}",
                    volume_id,
                    volume_path
                ))
            } else {
                Err(failure!(
                    Code::Internal,
                    "Failed to stat path {} for volume {}: {}",
                    volume_path,
                    volume_id,
                    error
                ))
            };
        }

        let stat = nix::sys::statvfs::statvfs(volume_path.as_str())
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to statvfs {} for volume {}: {}",
                    volume_path,
                    volume_id,
                    error
                )
            })?;

        let fragment = stat.fragment_size() as i64;
        let total_bytes = stat.blocks() as i64 * fragment;
        let available_bytes = stat.blocks_available() as i64 * fragment;
        let used_bytes =
            (stat.blocks() as i64 - stat.blocks_free() as i64) * fragment;

        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    total: total_bytes,
                    available: available_bytes,
                    used: used_bytes,
                    unit: volume_usage::Unit::Bytes as i32,
                },
                VolumeUsage {
                    total: stat.files() as i64,
                    available: stat.files_available() as i64,
                    used: (stat.files() - stat.files_free()) as i64,
                    unit: volume_usage::Unit::Inodes as i32,
                },
            ],
        }))
    }

    /// Grow the filesystem on the published path to fill its backing
    /// device. The reported capacity is the size the caller asked for;
    /// the grow is not re-measured.
    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let msg = request.into_inner();

        trace!("{:?}", msg);

        let volume_id = &msg.volume_id;
        let volume_path = &msg.volume_path;

        if volume_id.is_empty() || volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Invalid volume path or volume id"
            ));
        }

        let _guard = self.locks.lock(volume_path).await;

        let mounted = mount::device_from_mount(volume_path).ok_or_else(
            || {
                failure!(
                    Code::NotFound,
                    "Failed to expand volume {}: no mount at {}",
                    volume_id,
                    volume_path
                )
            },
        )?;

        if let Err(error) =
            crate::resize::resize(&mounted.source, volume_path).await
        {
            return Err(failure!(
                Code::Internal,
                "Failed to expand volume {} at {}: {}",
                volume_id,
                volume_path,
                error
            ));
        }

        let capacity_bytes = msg
            .capacity_range
            .map(|range| range.required_bytes)
            .unwrap_or(0);

        info!("Volume {} expanded at {}", volume_id, volume_path);

        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::GetVolumeStats,
            node_service_capability::rpc::Type::ExpandVolume,
        ];

        debug!("NodeGetCapabilities request: {:?}", caps);

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc {
                            r#type: c as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let mut segments = std::collections::HashMap::new();
        segments
            .insert(TOPOLOGY_REGION_KEY.to_string(), self.region.clone());

        debug!(
            "NodeGetInfo request: ID={}, region={}, max volumes={}",
            self.node_id, self.region, MAX_VOLS_PER_NODE
        );

        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: MAX_VOLS_PER_NODE as i64,
            accessible_topology: Some(Topology {
                segments,
            }),
        }))
    }
}
