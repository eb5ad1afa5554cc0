//! The publish context contract between the controller and the node.
//!
//! The context travels over the wire as an opaque string map; the keys
//! are defined once here and validated on both ends rather than being
//! scattered as literals through the attach and stage paths.

use std::collections::HashMap;

use crate::cloud::{CloudVolume, StorageClass};

/// Stable device label / share name used to locate the volume on the
/// node.
pub const MOUNT_VOL_NAME: &str = "mount_vol_name";

/// Storage class of the attachment: "block" or "vfs".
pub const STORAGE_TYPE: &str = "storage_type";

/// Validated form of the context emitted by ControllerPublishVolume and
/// consumed by NodeStageVolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContext {
    pub mount_vol_name: String,
    pub class: StorageClass,
}

impl PublishContext {
    pub fn new(volume: &CloudVolume) -> PublishContext {
        PublishContext {
            mount_vol_name: volume.mount_label.clone(),
            class: volume.class,
        }
    }

    pub fn into_map(self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(MOUNT_VOL_NAME.to_string(), self.mount_vol_name);
        map.insert(STORAGE_TYPE.to_string(), self.class.as_str().to_string());
        map
    }

    /// Parse a context received from the orchestrator. A missing
    /// storage_type means the attachment predates the vfs class and is
    /// treated as block; an unrecognized value is rejected.
    pub fn parse(
        context: &HashMap<String, String>,
    ) -> Result<PublishContext, String> {
        let mount_vol_name = context
            .get(MOUNT_VOL_NAME)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                format!("{} missing from publish context", MOUNT_VOL_NAME)
            })?
            .clone();

        let class = match context.get(STORAGE_TYPE) {
            None => StorageClass::Block,
            Some(value) => StorageClass::parse(value).ok_or_else(|| {
                format!("unknown {} \"{}\"", STORAGE_TYPE, value)
            })?,
        };

        Ok(PublishContext {
            mount_vol_name,
            class,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::VolumeState;

    fn volume(class: StorageClass) -> CloudVolume {
        CloudVolume {
            id: "vol-1".into(),
            label: "pvc-1".into(),
            mount_label: "ewr-vol-1".into(),
            class,
            region: "ewr".into(),
            size_gb: 10,
            attachments: vec![],
            state: VolumeState::Attached,
            filesystem_type: None,
        }
    }

    #[test]
    fn round_trips_for_both_classes() {
        for class in [StorageClass::Block, StorageClass::Vfs] {
            let built = PublishContext::new(&volume(class));
            let parsed =
                PublishContext::parse(&built.clone().into_map()).unwrap();
            assert_eq!(parsed, built);
        }
    }

    #[test]
    fn missing_storage_type_defaults_to_block() {
        let mut map = HashMap::new();
        map.insert(MOUNT_VOL_NAME.to_string(), "ewr-vol-1".to_string());

        let parsed = PublishContext::parse(&map).unwrap();
        assert_eq!(parsed.class, StorageClass::Block);
    }

    #[test]
    fn unknown_storage_type_is_rejected() {
        let mut map = HashMap::new();
        map.insert(MOUNT_VOL_NAME.to_string(), "ewr-vol-1".to_string());
        map.insert(STORAGE_TYPE.to_string(), "tape".to_string());

        assert!(PublishContext::parse(&map).is_err());
    }

    #[test]
    fn missing_mount_label_is_rejected() {
        let mut map = HashMap::new();
        map.insert(STORAGE_TYPE.to_string(), "block".to_string());

        assert!(PublishContext::parse(&map).is_err());
    }
}
