//! Utility functions for mounting and unmounting filesystems.
//!
//! The kernel mount table is the single source of truth for node-plane
//! idempotency: nothing in here caches mount state across calls.

use std::{collections::HashSet, io::Error};

use devinfo::mountinfo::{MountInfo, MountIter};
use sys_mount::{unmount, FilesystemType, Mount, MountFlags, UnmountFlags};

// Simple trait for checking if the readonly (ro) option
// is present in a "list" of options, while allowing for
// flexibility as to the type of "list".
pub(crate) trait ReadOnly {
    fn readonly(&self) -> bool;
}

impl ReadOnly for Vec<String> {
    fn readonly(&self) -> bool {
        self.iter().any(|entry| entry == "ro")
    }
}

impl ReadOnly for &str {
    fn readonly(&self) -> bool {
        self.split(',').any(|entry| entry == "ro")
    }
}

/// Return mountinfo matching source and/or destination. With stacked
/// mounts the entry mounted last wins.
pub(crate) fn find_mount(
    source: Option<&str>,
    target: Option<&str>,
) -> Option<MountInfo> {
    match_mounts(MountIter::new().unwrap().flatten(), source, target)
}

fn match_mounts(
    mounts: impl Iterator<Item = MountInfo>,
    source: Option<&str>,
    target: Option<&str>,
) -> Option<MountInfo> {
    let mut found: Option<MountInfo> = None;

    for mount in mounts {
        if let Some(value) = source {
            if mount.source.to_string_lossy() == value {
                if let Some(value) = target {
                    if mount.dest.to_string_lossy() == value {
                        found = Some(mount);
                    }
                    continue;
                }
                found = Some(mount);
            }
            continue;
        }
        if let Some(value) = target {
            if mount.dest.to_string_lossy() == value {
                found = Some(mount);
            }
        }
    }

    found
}

/// Device backing a mount point, from the inverse mount-table lookup.
pub(crate) fn device_from_mount(target: &str) -> Option<MountInfo> {
    find_mount(None, Some(target))
}

/// Check if options in "first" are also present in "second",
/// but exclude values "ro" and "rw" from the comparison.
pub(crate) fn subset(first: &[String], second: &[String]) -> bool {
    let set: HashSet<&String> = second.iter().collect();
    for entry in first {
        if entry == "ro" {
            continue;
        }
        if entry == "rw" {
            continue;
        }
        if set.get(entry).is_none() {
            return false;
        }
    }
    true
}

/// Return supported filesystems for block volumes. ext4 is first: it is
/// the default when the capability does not name one.
pub(crate) fn probe_filesystems() -> Vec<String> {
    vec![String::from("ext4"), String::from("xfs")]
}

// Utility function to transform a vector of options
// to the format required by sys_mount::Mount::new()
fn parse(options: &[String]) -> (bool, String) {
    let mut list: Vec<&str> = Vec::new();
    let mut readonly: bool = false;

    for entry in options {
        if entry == "ro" {
            readonly = true;
            continue;
        }

        if entry == "rw" {
            continue;
        }

        list.push(entry);
    }

    (readonly, list.join(","))
}

// Utility function to wrap a string in an Option.
// Note that, in particular, the empty string is mapped to None.
fn option(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

// Utility function used for displaying a list of options.
fn show(options: &[String]) -> String {
    let list: Vec<String> = options
        .iter()
        .cloned()
        .filter(|value| value != "rw")
        .collect();

    if list.is_empty() {
        return String::from("none");
    }

    list.join(",")
}

/// Mount a device to a directory (mountpoint)
pub(crate) fn filesystem_mount(
    device: &str,
    target: &str,
    fstype: &str,
    options: &[String],
) -> Result<Mount, Error> {
    let mut flags = MountFlags::empty();

    let (readonly, value) = parse(options);

    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    let mount = Mount::new(
        device,
        target,
        FilesystemType::Manual(fstype),
        flags,
        option(&value),
    )?;

    debug!(
        "Filesystem ({}) on device {} mounted onto target {} (options: {})",
        fstype,
        device,
        target,
        show(options)
    );

    Ok(mount)
}

/// Unmount a device from a directory (mountpoint)
/// Should not be used for removing bind mounts.
pub(crate) fn filesystem_unmount(target: &str) -> Result<(), Error> {
    let mut flags = UnmountFlags::empty();

    flags.insert(UnmountFlags::DETACH);

    unmount(target, flags)?;

    debug!("Target {} unmounted", target);

    Ok(())
}

/// Bind mount a source path to a target path.
pub(crate) fn bind_mount(source: &str, target: &str) -> Result<Mount, Error> {
    let mut flags = MountFlags::empty();

    flags.insert(MountFlags::BIND);

    let mount = Mount::new(
        source,
        target,
        FilesystemType::Manual("none"),
        flags,
        None,
    )?;

    debug!("Source {} bind mounted onto target {}", source, target);

    Ok(mount)
}

/// Bind remount a path to modify mount options.
/// Assumes that target has already been bind mounted.
pub(crate) fn bind_remount(
    target: &str,
    options: &[String],
) -> Result<Mount, Error> {
    let mut flags = MountFlags::empty();

    let (readonly, value) = parse(options);

    flags.insert(MountFlags::BIND);

    if readonly {
        flags.insert(MountFlags::RDONLY);
    }

    flags.insert(MountFlags::REMOUNT);

    let mount = Mount::new(
        "none",
        target,
        FilesystemType::Manual("none"),
        flags,
        option(&value),
    )?;

    debug!(
        "Target {} bind remounted (options: {})",
        target,
        show(options)
    );

    Ok(mount)
}

/// Unmounts a path that has previously been bind mounted.
/// Should not be used for unmounting devices.
pub(crate) fn bind_unmount(target: &str) -> Result<(), Error> {
    let flags = UnmountFlags::empty();

    unmount(target, flags)?;

    debug!("Target {} bind unmounted", target);

    Ok(())
}

// Mounts can stack on a path; unstage must peel all of them off before
// the directory is removed.
const UNMOUNT_CEILING: usize = 16;

/// Unmount whatever is mounted on `target` and remove the directory.
/// Succeeds on paths that are not mount points and on directories that
/// are already gone.
pub(crate) fn cleanup_mount_point(
    target: &str,
    umount_all: bool,
) -> Result<(), Error> {
    let mut rounds = 0;

    while find_mount(None, Some(target)).is_some() {
        filesystem_unmount(target)?;
        rounds += 1;
        if !umount_all || rounds >= UNMOUNT_CEILING {
            break;
        }
    }

    if let Err(error) = std::fs::remove_dir(target) {
        if error.kind() != std::io::ErrorKind::NotFound {
            return Err(error);
        }
    }

    debug!("Mount point {} cleaned up", target);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn mounts() -> Vec<MountInfo> {
        vec![
            MountInfo {
                source: PathBuf::from("/dev/vda"),
                dest: PathBuf::from("/mnt/staging/vol-1"),
                fstype: "ext4".into(),
                options: vec!["rw".into(), "relatime".into()],
            },
            MountInfo {
                source: PathBuf::from("ewr-share1"),
                dest: PathBuf::from("/mnt/staging/vfs-1"),
                fstype: "virtiofs".into(),
                options: vec!["rw".into()],
            },
            MountInfo {
                source: PathBuf::from("/dev/vda"),
                dest: PathBuf::from("/mnt/pods/pod-1"),
                fstype: "ext4".into(),
                options: vec!["ro".into(), "relatime".into()],
            },
        ]
    }

    #[test]
    fn matches_by_source_and_target() {
        let found = match_mounts(
            mounts().into_iter(),
            Some("/dev/vda"),
            Some("/mnt/staging/vol-1"),
        )
        .unwrap();
        assert_eq!(found.fstype, "ext4");

        assert!(match_mounts(
            mounts().into_iter(),
            Some("/dev/vdb"),
            Some("/mnt/staging/vol-1"),
        )
        .is_none());
    }

    #[test]
    fn matches_by_target_alone() {
        let found =
            match_mounts(mounts().into_iter(), None, Some("/mnt/pods/pod-1"))
                .unwrap();
        assert_eq!(found.source, PathBuf::from("/dev/vda"));
        assert!(found.options.readonly());
    }

    #[test]
    fn source_match_takes_the_last_entry() {
        let found = match_mounts(mounts().into_iter(), Some("/dev/vda"), None)
            .unwrap();
        assert_eq!(found.dest, PathBuf::from("/mnt/pods/pod-1"));
    }

    #[test]
    fn subset_ignores_rw_markers() {
        let requested =
            vec!["ro".to_string(), "rw".to_string(), "noatime".to_string()];
        let mounted = vec!["noatime".to_string(), "relatime".to_string()];
        assert!(subset(&requested, &mounted));

        let requested = vec!["discard".to_string()];
        assert!(!subset(&requested, &mounted));
    }

    #[test]
    fn parse_splits_readonly_from_data_options() {
        let (readonly, data) = parse(&[
            "ro".to_string(),
            "noatime".to_string(),
            "discard".to_string(),
        ]);
        assert!(readonly);
        assert_eq!(data, "noatime,discard");

        let (readonly, data) = parse(&["rw".to_string()]);
        assert!(!readonly);
        assert_eq!(data, "");
    }

    #[test]
    fn readonly_detection() {
        assert!("ro,relatime".readonly());
        assert!(!"rw,relatime".readonly());
        assert!(vec!["ro".to_string()].readonly());
    }

    #[test]
    fn default_filesystem_is_ext4() {
        assert_eq!(probe_filesystems()[0], "ext4");
    }
}
