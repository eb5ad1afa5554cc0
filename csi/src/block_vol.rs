//! Staging of block class volumes: locate the virtio disk by its stable
//! serial, format it on first use and mount it to the staging path.

use std::path::{Path, PathBuf};

use tonic::{Code, Status};

use crate::{
    csi::volume_capability::MountVolume,
    dev,
    failure,
    format::probed_format,
    mount,
    resize,
};

pub(crate) async fn stage_block_volume(
    volume_id: &str,
    staging_path: &str,
    mount_label: &str,
    mnt: &MountVolume,
    filesystems: &[String],
) -> Result<(), Status> {
    let device = dev::link_by_serial(mount_label).await.map_err(|error| {
        failure!(
            Code::NotFound,
            "Failed to stage volume {}: no device with serial {}: {}",
            volume_id,
            mount_label,
            error
        )
    })?;
    let device_str = device.display().to_string();

    let fstype = if mnt.fs_type.is_empty() {
        String::from(&filesystems[0])
    } else {
        match filesystems.iter().find(|&entry| entry == &mnt.fs_type) {
            Some(fstype) => String::from(fstype),
            None => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Failed to stage volume {}: unsupported filesystem type: {}",
                    volume_id,
                    mnt.fs_type
                ));
            }
        }
    };

    if let Some(existing) = mount::find_mount(None, Some(staging_path)) {
        if !same_device(&existing.source, &device) {
            return Err(failure!(
                Code::AlreadyExists,
                "Failed to stage volume {}: {} is already mounted from {}",
                volume_id,
                staging_path,
                existing.source.display()
            ));
        }
        info!(
            "Volume {} is already staged to {}",
            volume_id, staging_path
        );
    } else {
        if let Err(error) = probed_format(&device_str, &fstype).await {
            return Err(failure!(
                Code::Internal,
                "Failed to stage volume {}: error preparing device {}: {}",
                volume_id,
                device_str,
                error
            ));
        }

        debug!("Mounting device {} onto {}", device_str, staging_path);

        if let Err(error) = mount::filesystem_mount(
            &device_str,
            staging_path,
            &fstype,
            &mnt.mount_flags,
        ) {
            return Err(failure!(
                Code::Internal,
                "Failed to stage volume {}: failed to mount device {} onto {}: {}",
                volume_id,
                device_str,
                staging_path,
                error
            ));
        }

        info!("Volume {} staged to {}", volume_id, staging_path);
    }

    // The volume may have been grown while it was detached; the cloud
    // only resizes the virtual disk, never the filesystem on it.
    match resize::needs_resize(&device, staging_path) {
        Ok(true) => {
            if let Err(error) = resize::resize(&device, staging_path).await {
                return Err(failure!(
                    Code::Internal,
                    "Failed to stage volume {}: error growing filesystem on {}: {}",
                    volume_id,
                    device_str,
                    error
                ));
            }
        }
        Ok(false) => {}
        Err(error) => {
            warn!(
                "Skipping resize check for volume {}: {}",
                volume_id, error
            );
        }
    }

    Ok(())
}

// The mount table may record the device under any of its link names;
// compare resolved paths.
fn same_device(recorded: &Path, expected: &Path) -> bool {
    let recorded = std::fs::canonicalize(recorded)
        .unwrap_or_else(|_| PathBuf::from(recorded));
    let expected = std::fs::canonicalize(expected)
        .unwrap_or_else(|_| PathBuf::from(expected));
    recorded == expected
}
