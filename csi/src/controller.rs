//! Implementation of gRPC methods from the CSI Controller service.
//!
//! The controller is the sole serializer of volume lifecycle changes: a
//! per-volume lock is taken inside every RPC so concurrent requests for
//! the same volume are linearized while different volumes proceed in
//! parallel. The cloud inventory is eventually consistent, so state
//! transitions are awaited by polling rather than assumed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tonic::{Code, Request, Response, Status};

use crate::{
    cloud::{
        CloudApi,
        CloudError,
        CloudSnapshot,
        CloudVolume,
        CreateVolumeParams,
        StorageClass,
        VolumeState,
    },
    context::{self, PublishContext},
    csi::*,
    failure,
    locks::KeyedLocks,
    retry,
    GIB,
    MAX_VOLS_PER_NODE,
    TOPOLOGY_REGION_KEY,
};

/// Size provisioned when the request leaves the capacity open.
const DEFAULT_VOLUME_SIZE_GB: u64 = 10;

/// Storage class parameter of the storage class; absent means block.
const PARAM_STORAGE_TYPE: &str = "storage_type";

/// Floor on the provisioned size, in whole gigabytes.
const PARAM_MIN_SIZE_GB: &str = "minSizeGB";

/// Ceiling for polling the inventory for a state transition.
const CLOUD_STATE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Controller {
    cloud: Arc<dyn CloudApi>,
    locks: KeyedLocks,
}

impl Controller {
    pub fn new(cloud: Arc<dyn CloudApi>) -> Controller {
        Controller {
            cloud,
            locks: KeyedLocks::new(),
        }
    }

    /// Poll the inventory until the volume satisfies `predicate`.
    async fn wait_for_volume<P>(
        &self,
        id: &str,
        op: &str,
        predicate: P,
    ) -> Result<CloudVolume, Status>
    where
        P: Fn(&CloudVolume) -> bool,
    {
        let predicate = &predicate;
        let cloud = self.cloud.clone();

        let result = retry::wait_until(
            CLOUD_STATE_TIMEOUT,
            retry::BASE_INTERVAL,
            move || {
                let cloud = cloud.clone();
                let id = id.to_string();
                async move {
                    let volume = cloud.get_volume(&id).await?;
                    Ok(if predicate(&volume) {
                        Some(volume)
                    } else {
                        None
                    })
                }
            },
        )
        .await;

        match result {
            Ok(Some(volume)) => Ok(volume),
            Ok(None) => Err(failure!(
                Code::DeadlineExceeded,
                "Timed out waiting for volume {} while trying to {}",
                id,
                op
            )),
            Err(error) => Err(cloud_failure(op, error)),
        }
    }

    /// Pick the first topology preference whose region the cloud can
    /// actually provision in.
    async fn select_region(
        &self,
        requirements: Option<&TopologyRequirement>,
    ) -> Result<String, Status> {
        let regions = self
            .cloud
            .list_regions()
            .await
            .map_err(|error| cloud_failure("list regions", error))?;

        if let Some(requirements) = requirements {
            for topology in requirements
                .preferred
                .iter()
                .chain(requirements.requisite.iter())
            {
                if let Some(region) =
                    topology.segments.get(TOPOLOGY_REGION_KEY)
                {
                    if regions.iter().any(|known| &known.id == region) {
                        return Ok(region.clone());
                    }
                }
            }
        }

        Err(failure!(
            Code::ResourceExhausted,
            "No requested topology region is available in the cloud"
        ))
    }
}

fn cloud_failure(op: &str, error: CloudError) -> Status {
    let message = format!("Failed to {}: {}", op, error);
    error!("{}", message);
    let code = match error {
        CloudError::NotFound {
            ..
        } => Code::NotFound,
        CloudError::InvalidRequest {
            ..
        } => Code::InvalidArgument,
        // Transport problems reach here only once the retry budget is
        // spent.
        CloudError::RateLimited
        | CloudError::Transport {
            ..
        } => Code::Internal,
    };
    Status::new(code, message)
}

fn round_up_gb(bytes: u64) -> u64 {
    (bytes + GIB - 1) / GIB
}

fn storage_class(
    parameters: &HashMap<String, String>,
) -> Result<StorageClass, Status> {
    match parameters.get(PARAM_STORAGE_TYPE) {
        None => Ok(StorageClass::Block),
        Some(value) => StorageClass::parse(value).ok_or_else(|| {
            failure!(
                Code::InvalidArgument,
                "Unknown {} parameter: {}",
                PARAM_STORAGE_TYPE,
                value
            )
        }),
    }
}

fn supported_mode(
    class: StorageClass,
    mode: volume_capability::access_mode::Mode,
) -> bool {
    use crate::csi::volume_capability::access_mode::Mode;

    match class {
        StorageClass::Block => matches!(
            mode,
            Mode::SingleNodeWriter | Mode::SingleNodeReaderOnly
        ),
        StorageClass::Vfs => !matches!(mode, Mode::Unknown),
    }
}

fn check_capabilities(
    name: &str,
    class: StorageClass,
    capabilities: &[VolumeCapability],
) -> Result<(), Status> {
    use crate::csi::volume_capability::access_mode::Mode;

    if capabilities.is_empty() {
        return Err(failure!(
            Code::InvalidArgument,
            "No volume capabilities provided for {}",
            name
        ));
    }

    for capability in capabilities {
        let mode = capability
            .access_mode
            .as_ref()
            .and_then(|wrapper| Mode::from_i32(wrapper.mode))
            .unwrap_or(Mode::Unknown);
        if !supported_mode(class, mode) {
            return Err(failure!(
                Code::InvalidArgument,
                "Access mode {:?} is not supported for {} volumes ({})",
                mode,
                class,
                name
            ));
        }
    }

    Ok(())
}

/// Work out the provisioned size in whole gigabytes from the requested
/// byte range and the storage class floor.
fn select_size_gb(
    range: Option<&CapacityRange>,
    parameters: &HashMap<String, String>,
) -> Result<u64, Status> {
    let required = range.map(|range| range.required_bytes).unwrap_or(0);
    let limit = range.map(|range| range.limit_bytes).unwrap_or(0);

    if required < 0 || limit < 0 {
        return Err(failure!(
            Code::InvalidArgument,
            "Capacity range values must not be negative"
        ));
    }

    if limit > 0 && required > limit {
        return Err(failure!(
            Code::OutOfRange,
            "Required capacity {} exceeds the limit {}",
            required,
            limit
        ));
    }

    let floor_gb = match parameters.get(PARAM_MIN_SIZE_GB) {
        None => 0,
        Some(value) => value.parse::<u64>().map_err(|_| {
            failure!(
                Code::InvalidArgument,
                "Invalid {} parameter: {}",
                PARAM_MIN_SIZE_GB,
                value
            )
        })?,
    };

    let mut size_gb = round_up_gb(required as u64).max(floor_gb);
    if size_gb == 0 {
        size_gb = DEFAULT_VOLUME_SIZE_GB;
    }

    if limit > 0 && size_gb * GIB > limit as u64 {
        return Err(failure!(
            Code::OutOfRange,
            "Capacity floor of {} GB exceeds the limit {}",
            size_gb,
            limit
        ));
    }

    Ok(size_gb)
}

fn csi_volume(
    volume: &CloudVolume,
    content_source: Option<VolumeContentSource>,
) -> Volume {
    let mut volume_context = HashMap::new();
    volume_context.insert(
        context::STORAGE_TYPE.to_string(),
        volume.class.as_str().to_string(),
    );

    let mut segments = HashMap::new();
    segments
        .insert(TOPOLOGY_REGION_KEY.to_string(), volume.region.clone());

    Volume {
        capacity_bytes: volume.capacity_bytes() as i64,
        volume_id: volume.id.clone(),
        volume_context,
        content_source,
        accessible_topology: vec![Topology {
            segments,
        }],
    }
}

fn timestamp(at: &DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
    }
}

fn csi_snapshot(snapshot: &CloudSnapshot) -> Snapshot {
    Snapshot {
        size_bytes: (snapshot.size_gb * GIB) as i64,
        snapshot_id: snapshot.id.clone(),
        source_volume_id: snapshot.source_volume_id.clone(),
        creation_time: Some(timestamp(&snapshot.created_at)),
        ready_to_use: snapshot.ready,
    }
}

/// Parse a paging token; the empty token starts from the beginning.
fn paging_start(token: &str) -> Result<usize, Status> {
    if token.is_empty() {
        return Ok(0);
    }
    token.parse().map_err(|_| {
        failure!(Code::Aborted, "Invalid starting token: {}", token)
    })
}

fn paging_end(start: usize, max_entries: i32, len: usize) -> usize {
    if max_entries > 0 {
        std::cmp::min(start + max_entries as usize, len)
    } else {
        len
    }
}

#[tonic::async_trait]
impl controller_server::Controller for Controller {
    /// Provision a new volume, or return the existing one when a volume
    /// of this name with compatible attributes already exists. This
    /// operation MUST be idempotent.
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.name.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume name must not be empty"
            ));
        }

        let class = storage_class(&args.parameters)?;
        check_capabilities(&args.name, class, &args.volume_capabilities)?;

        let size_gb =
            select_size_gb(args.capacity_range.as_ref(), &args.parameters)?;
        let required = args
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .unwrap_or(0) as u64;
        let limit = args
            .capacity_range
            .as_ref()
            .map(|range| range.limit_bytes)
            .unwrap_or(0) as u64;

        let _guard = self.locks.lock(&args.name).await;

        let region = self
            .select_region(args.accessibility_requirements.as_ref())
            .await?;

        let mut params = CreateVolumeParams {
            label: args.name.clone(),
            region: region.clone(),
            size_gb,
            class,
            ..Default::default()
        };

        if let Some(source) = &args.volume_content_source {
            match &source.r#type {
                Some(volume_content_source::Type::Snapshot(snap)) => {
                    let snapshot = self
                        .cloud
                        .get_snapshot(&snap.snapshot_id)
                        .await
                        .map_err(|error| {
                            cloud_failure("read source snapshot", error)
                        })?;
                    params.source_snapshot = Some(snapshot.id);
                }
                Some(volume_content_source::Type::Volume(origin)) => {
                    let origin = self
                        .cloud
                        .get_volume(&origin.volume_id)
                        .await
                        .map_err(|error| {
                            cloud_failure("read source volume", error)
                        })?;
                    if origin.class != class {
                        return Err(failure!(
                            Code::InvalidArgument,
                            "Cannot clone {} volume {} into a {} volume",
                            origin.class,
                            origin.id,
                            class
                        ));
                    }
                    params.source_volume = Some(origin.id);
                }
                None => {
                    return Err(failure!(
                        Code::InvalidArgument,
                        "Empty volume content source for {}",
                        args.name
                    ));
                }
            }
        }

        // The volume may already exist under this name from an earlier,
        // perhaps interrupted, invocation.
        let existing: Vec<CloudVolume> = self
            .cloud
            .list_volumes()
            .await
            .map_err(|error| cloud_failure("list volumes", error))?
            .into_iter()
            .filter(|volume| volume.label == args.name)
            .collect();

        match existing.len() {
            0 => {}
            1 => {
                let found = &existing[0];
                let compatible = found.class == class
                    && found.region == region
                    && found.capacity_bytes() >= required
                    && (limit == 0 || found.capacity_bytes() <= limit);
                if !compatible {
                    return Err(failure!(
                        Code::AlreadyExists,
                        "Volume {} already exists with incompatible attributes",
                        args.name
                    ));
                }
                let volume = self
                    .wait_for_volume(&found.id, "create volume", |volume| {
                        volume.state == VolumeState::Available
                    })
                    .await?;
                info!("Volume {} already exists", volume.id);
                return Ok(Response::new(CreateVolumeResponse {
                    volume: Some(csi_volume(
                        &volume,
                        args.volume_content_source,
                    )),
                }));
            }
            _ => {
                return Err(failure!(
                    Code::Internal,
                    "Multiple volumes found with name {}",
                    args.name
                ));
            }
        }

        let created = self
            .cloud
            .create_volume(params)
            .await
            .map_err(|error| cloud_failure("create volume", error))?;

        // On timeout the volume is left in place: a retry under the same
        // name reattaches to the record created here.
        let volume = self
            .wait_for_volume(&created.id, "create volume", |volume| {
                volume.state == VolumeState::Available
            })
            .await?;

        info!(
            "Created volume {} ({} GB, {}) in {}",
            volume.id, volume.size_gb, volume.class, volume.region
        );

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(csi_volume(&volume, args.volume_content_source)),
        }))
    }

    /// This operation MUST be idempotent: deleting an absent volume is
    /// success.
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume id must not be empty"
            ));
        }

        let _guard = self.locks.lock(&args.volume_id).await;

        let volume = match self.cloud.get_volume(&args.volume_id).await {
            Ok(volume) => volume,
            Err(CloudError::NotFound {
                ..
            }) => {
                debug!("Volume {} does not exist", args.volume_id);
                return Ok(Response::new(DeleteVolumeResponse {}));
            }
            Err(error) => return Err(cloud_failure("delete volume", error)),
        };

        if let Some(attached) = volume.attachments.first() {
            return Err(failure!(
                Code::FailedPrecondition,
                "Volume {} is still attached to {}",
                args.volume_id,
                attached
            ));
        }

        match self.cloud.delete_volume(&volume.id).await {
            Ok(())
            | Err(CloudError::NotFound {
                ..
            }) => {}
            Err(error) => return Err(cloud_failure("delete volume", error)),
        }

        info!("Deleted volume {}", args.volume_id);

        Ok(Response::new(DeleteVolumeResponse {}))
    }

    /// Attach the volume to a node. Block volumes are exclusive: a
    /// volume attached elsewhere is a precondition failure, re-attaching
    /// to the same node returns the cached publish context.
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.volume_id.is_empty() || args.node_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume id and node id must not be empty"
            ));
        }

        let capability = args.volume_capability.as_ref().ok_or_else(|| {
            failure!(
                Code::InvalidArgument,
                "No volume capability provided for {}",
                args.volume_id
            )
        })?;

        let _guard = self.locks.lock(&args.volume_id).await;

        let volume = self
            .cloud
            .get_volume(&args.volume_id)
            .await
            .map_err(|error| cloud_failure("publish volume", error))?;

        check_capabilities(
            &volume.id,
            volume.class,
            std::slice::from_ref(capability),
        )?;

        let instance = self
            .cloud
            .get_instance(&args.node_id)
            .await
            .map_err(|error| cloud_failure("publish volume", error))?;

        if volume.class == StorageClass::Block {
            if let Some(attached) = volume.attachments.first() {
                if attached != &args.node_id {
                    return Err(failure!(
                        Code::FailedPrecondition,
                        "Volume {} is already attached to {}",
                        args.volume_id,
                        attached
                    ));
                }
                info!(
                    "Volume {} is already attached to {}",
                    volume.id, args.node_id
                );
                return Ok(Response::new(ControllerPublishVolumeResponse {
                    publish_context: PublishContext::new(&volume).into_map(),
                }));
            }

            let attached_count = self
                .cloud
                .list_volumes()
                .await
                .map_err(|error| cloud_failure("list volumes", error))?
                .iter()
                .filter(|candidate| {
                    candidate.class == StorageClass::Block
                        && candidate.attached_to(&instance.id)
                })
                .count();
            if attached_count >= MAX_VOLS_PER_NODE {
                return Err(failure!(
                    Code::ResourceExhausted,
                    "Node {} has reached the limit of {} attached volumes",
                    args.node_id,
                    MAX_VOLS_PER_NODE
                ));
            }
        } else if volume.attached_to(&args.node_id) {
            info!(
                "Volume {} is already attached to {}",
                volume.id, args.node_id
            );
            return Ok(Response::new(ControllerPublishVolumeResponse {
                publish_context: PublishContext::new(&volume).into_map(),
            }));
        }

        self.cloud
            .attach_volume(&volume.id, &instance.id)
            .await
            .map_err(|error| cloud_failure("publish volume", error))?;

        let volume = self
            .wait_for_volume(&volume.id, "publish volume", |volume| {
                volume.attached_to(&args.node_id)
            })
            .await?;

        info!("Volume {} attached to node {}", volume.id, args.node_id);

        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: PublishContext::new(&volume).into_map(),
        }))
    }

    /// This operation MUST be idempotent: a volume or node that is
    /// already gone, or an attachment that no longer exists, is success.
    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume id must not be empty"
            ));
        }

        let _guard = self.locks.lock(&args.volume_id).await;

        let volume = match self.cloud.get_volume(&args.volume_id).await {
            Ok(volume) => volume,
            Err(CloudError::NotFound {
                ..
            }) => {
                debug!("Volume {} does not exist", args.volume_id);
                return Ok(Response::new(
                    ControllerUnpublishVolumeResponse {},
                ));
            }
            Err(error) => {
                return Err(cloud_failure("unpublish volume", error))
            }
        };

        // An empty node id means detach wherever the volume is attached.
        let targets: Vec<String> = if args.node_id.is_empty() {
            volume.attachments.clone()
        } else if volume.attached_to(&args.node_id) {
            vec![args.node_id.clone()]
        } else {
            debug!(
                "Volume {} is not attached to {}",
                args.volume_id, args.node_id
            );
            return Ok(Response::new(ControllerUnpublishVolumeResponse {}));
        };

        for node in &targets {
            match self.cloud.detach_volume(&volume.id, node).await {
                Ok(())
                | Err(CloudError::NotFound {
                    ..
                }) => {}
                Err(error) => {
                    return Err(cloud_failure("unpublish volume", error))
                }
            }
        }

        let volume = self
            .wait_for_volume(&volume.id, "unpublish volume", |volume| {
                targets.iter().all(|node| !volume.attached_to(node))
            })
            .await?;

        info!("Volume {} detached", volume.id);

        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        use crate::csi::volume_capability::access_mode::Mode;

        let args = request.into_inner();

        trace!("{:?}", args);

        if args.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume id must not be empty"
            ));
        }

        if args.volume_capabilities.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "No volume capabilities provided for {}",
                args.volume_id
            ));
        }

        let volume = self
            .cloud
            .get_volume(&args.volume_id)
            .await
            .map_err(|error| {
                cloud_failure("validate volume capabilities", error)
            })?;

        let unsupported = args
            .volume_capabilities
            .iter()
            .map(|capability| {
                capability
                    .access_mode
                    .as_ref()
                    .and_then(|wrapper| Mode::from_i32(wrapper.mode))
                    .unwrap_or(Mode::Unknown)
            })
            .find(|mode| !supported_mode(volume.class, *mode));

        let response = match unsupported {
            None => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(
                    validate_volume_capabilities_response::Confirmed {
                        volume_context: args.volume_context,
                        volume_capabilities: args.volume_capabilities,
                        parameters: args.parameters,
                    },
                ),
                message: String::new(),
            },
            Some(mode) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: format!(
                    "Access mode {:?} is not supported for {} volumes",
                    mode, volume.class
                ),
            },
        };

        Ok(Response::new(response))
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        let mut volumes = self
            .cloud
            .list_volumes()
            .await
            .map_err(|error| cloud_failure("list volumes", error))?;
        volumes.sort_by(|a, b| a.id.cmp(&b.id));

        let start = paging_start(&args.starting_token)?;
        let end = paging_end(start, args.max_entries, volumes.len());

        let entries = volumes
            .get(start .. end)
            .unwrap_or(&[])
            .iter()
            .map(|volume| list_volumes_response::Entry {
                volume: Some(csi_volume(volume, None)),
            })
            .collect();

        let next_token = if end < volumes.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        // The cloud inventory does not expose pool capacity.
        Err(Status::new(Code::Unimplemented, "GetCapacity is not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let caps = vec![
            controller_service_capability::rpc::Type::CreateDeleteVolume,
            controller_service_capability::rpc::Type::PublishUnpublishVolume,
            controller_service_capability::rpc::Type::ExpandVolume,
            controller_service_capability::rpc::Type::CreateDeleteSnapshot,
            controller_service_capability::rpc::Type::ListSnapshots,
            controller_service_capability::rpc::Type::CloneVolume,
        ];

        debug!("ControllerGetCapabilities request: {:?}", caps);

        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc {
                            r#type: c as i32,
                        },
                    )),
                })
                .collect(),
        }))
    }

    /// Snapshot a block volume. This operation MUST be idempotent:
    /// a snapshot of this name for the same source volume is returned
    /// as-is.
    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.name.is_empty() || args.source_volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Snapshot name and source volume id must not be empty"
            ));
        }

        let _guard = self.locks.lock(&args.source_volume_id).await;

        let existing: Vec<CloudSnapshot> = self
            .cloud
            .list_snapshots()
            .await
            .map_err(|error| cloud_failure("list snapshots", error))?
            .into_iter()
            .filter(|snapshot| snapshot.label == args.name)
            .collect();

        match existing.len() {
            0 => {}
            1 => {
                let found = &existing[0];
                if found.source_volume_id != args.source_volume_id {
                    return Err(failure!(
                        Code::AlreadyExists,
                        "Snapshot {} already exists for volume {}",
                        args.name,
                        found.source_volume_id
                    ));
                }
                info!("Snapshot {} already exists", found.id);
                return Ok(Response::new(CreateSnapshotResponse {
                    snapshot: Some(csi_snapshot(found)),
                }));
            }
            _ => {
                return Err(failure!(
                    Code::Internal,
                    "Multiple snapshots found with name {}",
                    args.name
                ));
            }
        }

        let volume = self
            .cloud
            .get_volume(&args.source_volume_id)
            .await
            .map_err(|error| cloud_failure("create snapshot", error))?;

        if volume.class != StorageClass::Block {
            return Err(failure!(
                Code::InvalidArgument,
                "Snapshots are only supported for block volumes, {} is {}",
                volume.id,
                volume.class
            ));
        }

        let snapshot = self
            .cloud
            .create_snapshot(&volume.id, &args.name)
            .await
            .map_err(|error| cloud_failure("create snapshot", error))?;

        info!(
            "Created snapshot {} of volume {}",
            snapshot.id, volume.id
        );

        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(csi_snapshot(&snapshot)),
        }))
    }

    /// This operation MUST be idempotent: deleting an absent snapshot is
    /// success.
    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.snapshot_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Snapshot id must not be empty"
            ));
        }

        match self.cloud.delete_snapshot(&args.snapshot_id).await {
            Ok(())
            | Err(CloudError::NotFound {
                ..
            }) => {}
            Err(error) => {
                return Err(cloud_failure("delete snapshot", error))
            }
        }

        info!("Deleted snapshot {}", args.snapshot_id);

        Ok(Response::new(DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        let mut snapshots = self
            .cloud
            .list_snapshots()
            .await
            .map_err(|error| cloud_failure("list snapshots", error))?;
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));

        // Filtering by an unknown id yields an empty list, not an error.
        if !args.snapshot_id.is_empty() {
            snapshots.retain(|snapshot| snapshot.id == args.snapshot_id);
        }
        if !args.source_volume_id.is_empty() {
            snapshots.retain(|snapshot| {
                snapshot.source_volume_id == args.source_volume_id
            });
        }

        let start = paging_start(&args.starting_token)?;
        let end = paging_end(start, args.max_entries, snapshots.len());

        let entries = snapshots
            .get(start .. end)
            .unwrap_or(&[])
            .iter()
            .map(|snapshot| list_snapshots_response::Entry {
                snapshot: Some(csi_snapshot(snapshot)),
            })
            .collect();

        let next_token = if end < snapshots.len() {
            end.to_string()
        } else {
            String::new()
        };

        Ok(Response::new(ListSnapshotsResponse {
            entries,
            next_token,
        }))
    }

    /// Grow the volume in the cloud. Shrinking is forbidden; the node
    /// plane grows the filesystem afterwards, hence
    /// node_expansion_required.
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let args = request.into_inner();

        trace!("{:?}", args);

        if args.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Volume id must not be empty"
            ));
        }

        let _guard = self.locks.lock(&args.volume_id).await;

        let volume = self
            .cloud
            .get_volume(&args.volume_id)
            .await
            .map_err(|error| cloud_failure("expand volume", error))?;

        let size_gb = select_size_gb(
            args.capacity_range.as_ref(),
            &HashMap::new(),
        )?;

        if size_gb < volume.size_gb {
            return Err(failure!(
                Code::FailedPrecondition,
                "Cannot shrink volume {} from {} GB to {} GB",
                volume.id,
                volume.size_gb,
                size_gb
            ));
        }

        if size_gb > volume.size_gb {
            self.cloud
                .resize_volume(&volume.id, size_gb)
                .await
                .map_err(|error| cloud_failure("expand volume", error))?;

            self.wait_for_volume(&volume.id, "expand volume", |volume| {
                volume.size_gb >= size_gb
            })
            .await?;

            info!(
                "Expanded volume {} from {} GB to {} GB",
                volume.id, volume.size_gb, size_gb
            );
        }

        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: (size_gb * GIB) as i64,
            node_expansion_required: true,
        }))
    }
}
