//! Location of virtio block devices by their stable by-id link.
//!
//! The orchestrator may invoke stage before udev has settled after a bus
//! hotplug, so lookup is a bounded wait for the link rather than a
//! single probe.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::time::sleep;

use crate::error::DeviceError;

/// Directory of stable device links maintained by udev.
pub(crate) const DISK_PATH: &str = "/dev/disk/by-id";

/// Link prefix for virtio disks; the suffix is the volume's mount label.
pub(crate) const DISK_PREFIX: &str = "virtio-";

const LINK_WAIT_RETRIES: u32 = 10;
const LINK_WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// The by-id path at which a volume with the given mount label is
/// expected to surface.
pub(crate) fn by_id_path(label: &str) -> PathBuf {
    Path::new(DISK_PATH).join(format!("{}{}", DISK_PREFIX, label))
}

/// Wait for the by-id link of `label` to be populated, then resolve it to
/// the kernel device node.
pub(crate) async fn link_by_serial(
    label: &str,
) -> Result<PathBuf, DeviceError> {
    let link =
        wait_for_link(&by_id_path(label), LINK_WAIT_RETRIES, LINK_WAIT_INTERVAL)
            .await?;
    Ok(std::fs::canonicalize(link)?)
}

async fn wait_for_link(
    path: &Path,
    retries: u32,
    interval: Duration,
) -> Result<PathBuf, DeviceError> {
    for attempt in 0 ..= retries {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        if attempt < retries {
            debug!("Device link {} not present yet, waiting", path.display());
            sleep(interval).await;
        }
    }
    Err(DeviceError::new(&format!(
        "device link {} did not appear",
        path.display()
    )))
}
