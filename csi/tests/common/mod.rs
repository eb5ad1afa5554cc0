//! In-memory cloud inventory backing the controller integration tests.
//!
//! Behaves like the real inventory with no latency: attachments and
//! resizes settle immediately, so the controller's polling loops succeed
//! on their first probe.

use std::sync::Mutex;

use chrono::Utc;

use csi::cloud::{
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

pub struct MockCloud {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    volumes: Vec<CloudVolume>,
    snapshots: Vec<CloudSnapshot>,
    instances: Vec<Instance>,
    regions: Vec<Region>,
    sequence: u64,
}

impl MockCloud {
    pub fn new(regions: &[&str], instances: &[(&str, &str)]) -> MockCloud {
        MockCloud {
            state: Mutex::new(State {
                regions: regions
                    .iter()
                    .map(|id| Region {
                        id: id.to_string(),
                    })
                    .collect(),
                instances: instances
                    .iter()
                    .map(|(id, region)| Instance {
                        id: id.to_string(),
                        region: region.to_string(),
                    })
                    .collect(),
                ..Default::default()
            }),
        }
    }

    pub fn volume(&self, id: &str) -> Option<CloudVolume> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .iter()
            .find(|volume| volume.id == id)
            .cloned()
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }
}

#[tonic::async_trait]
impl CloudApi for MockCloud {
    async fn list_volumes(&self) -> Result<Vec<CloudVolume>, CloudError> {
        Ok(self.state.lock().unwrap().volumes.clone())
    }

    async fn get_volume(&self, id: &str) -> Result<CloudVolume, CloudError> {
        self.volume(id)
            .ok_or_else(|| CloudError::not_found("volume", id))
    }

    async fn create_volume(
        &self,
        params: CreateVolumeParams,
    ) -> Result<CloudVolume, CloudError> {
        let mut state = self.state.lock().unwrap();

        if let Some(snapshot) = &params.source_snapshot {
            if !state.snapshots.iter().any(|known| &known.id == snapshot) {
                return Err(CloudError::not_found("snapshot", snapshot));
            }
        }

        state.sequence += 1;
        let id = format!("vol-{}", state.sequence);
        let volume = CloudVolume {
            id: id.clone(),
            label: params.label,
            mount_label: format!("{}-{}", params.region, id),
            class: params.class,
            region: params.region,
            size_gb: params.size_gb,
            attachments: vec![],
            state: VolumeState::Available,
            filesystem_type: None,
        };
        state.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        let before = state.volumes.len();
        state.volumes.retain(|volume| volume.id != id);
        if state.volumes.len() == before {
            return Err(CloudError::not_found("volume", id));
        }
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: &str,
        instance_id: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();

        if !state
            .instances
            .iter()
            .any(|instance| instance.id == instance_id)
        {
            return Err(CloudError::not_found("instance", instance_id));
        }

        let volume = state
            .volumes
            .iter_mut()
            .find(|volume| volume.id == id)
            .ok_or_else(|| CloudError::not_found("volume", id))?;

        if volume.class == StorageClass::Block
            && !volume.attachments.is_empty()
            && !volume.attached_to(instance_id)
        {
            return Err(CloudError::InvalidRequest {
                message: format!("volume {} is attached elsewhere", id),
            });
        }

        if !volume.attached_to(instance_id) {
            volume.attachments.push(instance_id.to_string());
        }
        if volume.class == StorageClass::Block {
            volume.state = VolumeState::Attached;
        }
        Ok(())
    }

    async fn detach_volume(
        &self,
        id: &str,
        instance_id: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();

        let volume = state
            .volumes
            .iter_mut()
            .find(|volume| volume.id == id)
            .ok_or_else(|| CloudError::not_found("volume", id))?;

        volume.attachments.retain(|node| node != instance_id);
        if volume.attachments.is_empty() {
            volume.state = VolumeState::Available;
        }
        Ok(())
    }

    async fn resize_volume(
        &self,
        id: &str,
        size_gb: u64,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();

        let volume = state
            .volumes
            .iter_mut()
            .find(|volume| volume.id == id)
            .ok_or_else(|| CloudError::not_found("volume", id))?;

        if size_gb < volume.size_gb {
            return Err(CloudError::InvalidRequest {
                message: format!("volume {} cannot shrink", id),
            });
        }
        volume.size_gb = size_gb;
        Ok(())
    }

    async fn list_snapshots(
        &self,
    ) -> Result<Vec<CloudSnapshot>, CloudError> {
        Ok(self.state.lock().unwrap().snapshots.clone())
    }

    async fn get_snapshot(
        &self,
        id: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .find(|snapshot| snapshot.id == id)
            .cloned()
            .ok_or_else(|| CloudError::not_found("snapshot", id))
    }

    async fn create_snapshot(
        &self,
        source_volume_id: &str,
        label: &str,
    ) -> Result<CloudSnapshot, CloudError> {
        let mut state = self.state.lock().unwrap();

        let size_gb = state
            .volumes
            .iter()
            .find(|volume| volume.id == source_volume_id)
            .ok_or_else(|| {
                CloudError::not_found("volume", source_volume_id)
            })?
            .size_gb;

        state.sequence += 1;
        let snapshot = CloudSnapshot {
            id: format!("snap-{}", state.sequence),
            label: label.to_string(),
            source_volume_id: source_volume_id.to_string(),
            size_gb,
            created_at: Utc::now(),
            ready: true,
        };
        state.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        let before = state.snapshots.len();
        state.snapshots.retain(|snapshot| snapshot.id != id);
        if state.snapshots.len() == before {
            return Err(CloudError::not_found("snapshot", id));
        }
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, CloudError> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|instance| instance.id == id)
            .cloned()
            .ok_or_else(|| CloudError::not_found("instance", id))
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CloudError> {
        Ok(self.state.lock().unwrap().regions.clone())
    }
}
