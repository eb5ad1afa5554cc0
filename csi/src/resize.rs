//! Online filesystem grow for block volumes.
//!
//! Invoked from NodeExpandVolume and, defensively, at the end of staging
//! a block volume to absorb a cloud-side resize that happened while the
//! volume was detached.

use std::path::Path;

use tokio::process::Command;

use crate::{error::DeviceError, mount};

/// Device capacity the filesystem may lag behind by before a grow is
/// considered necessary. Filesystem metadata overhead stays well below
/// this at the volume sizes the cloud hands out; resizes are whole
/// gigabytes.
const RESIZE_SLACK: u64 = 512 * 1024 * 1024;

/// Compare the block device size against the capacity the mounted
/// filesystem reports. True when the filesystem is stale-sized and an
/// online grow would gain space.
pub(crate) fn needs_resize(
    device: &Path,
    mountpoint: &str,
) -> Result<bool, DeviceError> {
    let device_bytes = sysfs::block_device_size_bytes(device)?;

    let stat = nix::sys::statvfs::statvfs(mountpoint)?;
    let fs_bytes = stat.blocks() as u64 * stat.fragment_size() as u64;

    Ok(device_bytes > fs_bytes && device_bytes - fs_bytes > RESIZE_SLACK)
}

/// Grow the filesystem mounted at `mountpoint` to fill its backing
/// device. The ext family grows by device path, xfs by mount point; both
/// are online operations.
pub(crate) async fn resize(
    device: &Path,
    mountpoint: &str,
) -> Result<(), DeviceError> {
    let mounted = mount::find_mount(None, Some(mountpoint)).ok_or_else(
        || {
            DeviceError::new(&format!(
                "{} is not a mount point",
                mountpoint
            ))
        },
    )?;

    let (program, argument) = match mounted.fstype.as_str() {
        "ext2" | "ext3" | "ext4" => {
            ("resize2fs", device.display().to_string())
        }
        "xfs" => ("xfs_growfs", mountpoint.to_string()),
        other => {
            return Err(DeviceError::new(&format!(
                "cannot grow {} filesystem on {}",
                other, mountpoint
            )));
        }
    };

    debug!("Growing {} filesystem on {}", mounted.fstype, mountpoint);

    let output = Command::new(program).arg(&argument).output().await?;
    if !output.status.success() {
        return Err(DeviceError::from(format!(
            "{} {} failed: {}",
            program,
            argument,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    info!(
        "Filesystem on {} grown to fill {}",
        mountpoint,
        device.display()
    );

    Ok(())
}
