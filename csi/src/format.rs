//! Utility function for formatting a device with filesystem

use tokio::process::Command;

/// We probe the device for a filesystem, if there we leave it as is. We
/// do not check whether the existing FS is the desired FS. This is done
/// with the mindset of, never over write/delete data.
pub(crate) async fn probed_format(
    device: &str,
    fstype: &str,
) -> Result<(), String> {
    match probe_filesystem_type(device).await? {
        Some(existing) => {
            info!(
                "Skipping format: device {} contains a preexisting {} filesystem",
                device, existing
            );
        }
        None => {
            debug!("Formatting device {} with a {} filesystem", device, fstype);
            let output = Command::new(format!("mkfs.{}", fstype))
                .arg(device)
                .output()
                .await
                .map_err(|error| {
                    format!("Failed to execute mkfs.{}: {}", fstype, error)
                })?;
            if !output.status.success() {
                return Err(format!(
                    "Failed to format {} with {} fs: {}",
                    device,
                    fstype,
                    String::from_utf8_lossy(&output.stderr)
                ));
            }
            info!("Device {} formatted with {} filesystem", device, fstype);
        }
    }

    Ok(())
}

// blkid exits with status 2 when the device carries no recognizable
// signature, which is the go-ahead-and-format case.
async fn probe_filesystem_type(
    device: &str,
) -> Result<Option<String>, String> {
    let output = Command::new("blkid")
        .args(&["-o", "value", "-s", "TYPE", device])
        .output()
        .await
        .map_err(|error| format!("Failed to execute blkid: {}", error))?;

    if output.status.success() {
        let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if fstype.is_empty() {
            None
        } else {
            Some(fstype)
        })
    } else if output.status.code() == Some(2) {
        Ok(None)
    } else {
        Err(format!(
            "Failed to probe {}: {}",
            device,
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}
