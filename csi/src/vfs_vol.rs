//! Staging of vfs class volumes: a virtio-fs share is mounted directly
//! by its share tag, no device node and no formatting involved.

use std::path::Path;

use tonic::{Code, Status};

use crate::{failure, mount};

pub(crate) const VFS_FSTYPE: &str = "virtiofs";

pub(crate) fn stage_vfs_volume(
    volume_id: &str,
    staging_path: &str,
    share: &str,
) -> Result<(), Status> {
    if let Some(existing) = mount::find_mount(None, Some(staging_path)) {
        if existing.source != Path::new(share) {
            return Err(failure!(
                Code::AlreadyExists,
                "Failed to stage volume {}: {} is already mounted from {:?}",
                volume_id,
                staging_path,
                existing.source
            ));
        }
        info!(
            "Volume {} is already staged to {}",
            volume_id, staging_path
        );
        return Ok(());
    }

    debug!("Mounting share {} onto {}", share, staging_path);

    if let Err(error) =
        mount::filesystem_mount(share, staging_path, VFS_FSTYPE, &[])
    {
        return Err(failure!(
            Code::Internal,
            "Failed to stage volume {}: failed to mount share {} onto {}: {}",
            volume_id,
            share,
            staging_path,
            error
        ));
    }

    info!("Volume {} staged to {}", volume_id, staging_path);

    Ok(())
}
