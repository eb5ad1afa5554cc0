///! Utility functions for reading the state of sysfs block device
/// objects.
use std::{
    fs,
    io::{Error, ErrorKind, Result},
    path::Path,
    str::FromStr,
};

/// Kernel sector size used by the `size` attribute, independent of the
/// device's logical block size.
const SECTOR_SIZE: u64 = 512;

/// Read and parse a value from a sysfs attribute file.
pub fn parse_value<T>(dir: &Path, file: &str) -> Result<T>
where
    T: FromStr,
{
    let path = dir.join(file);
    let value = fs::read_to_string(&path)?;
    let value = value.trim();
    value.parse().map_err(|_| {
        Error::new(
            ErrorKind::InvalidData,
            format!("Failed to parse {}: {}", path.display(), value),
        )
    })
}

/// Size in bytes of a block device, looked up by kernel device name
/// (e.g. "vda"), read from the given sysfs class directory.
pub fn device_size_from(sys_class_block: &Path, device: &str) -> Result<u64> {
    let sectors: u64 = parse_value(&sys_class_block.join(device), "size")?;
    Ok(sectors * SECTOR_SIZE)
}

/// Size in bytes of a block device given its /dev path. Symlinks such as
/// the /dev/disk/by-id entries are resolved to the kernel device first.
pub fn block_device_size_bytes(device_path: &Path) -> Result<u64> {
    let resolved = fs::canonicalize(device_path)?;
    let name = resolved
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid device path {}", device_path.display()),
            )
        })?;
    device_size_from(Path::new("/sys/class/block"), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join("sysfs-tests")
            .join(format!("{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parses_numeric_attribute() {
        let dir = scratch_dir("numeric");
        let mut file = fs::File::create(dir.join("size")).unwrap();
        writeln!(file, "20971520").unwrap();

        let sectors: u64 = parse_value(&dir, "size").unwrap();
        assert_eq!(sectors, 20_971_520);
    }

    #[test]
    fn rejects_garbage_attribute() {
        let dir = scratch_dir("garbage");
        fs::write(dir.join("size"), "not-a-number\n").unwrap();

        let result: Result<u64> = parse_value(&dir, "size");
        assert!(result.is_err());
    }

    #[test]
    fn device_size_is_sectors_times_512() {
        let dir = scratch_dir("device");
        fs::create_dir_all(dir.join("vda")).unwrap();
        fs::write(dir.join("vda").join("size"), "20971520\n").unwrap();

        let bytes = device_size_from(&dir, "vda").unwrap();
        assert_eq!(bytes, 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn missing_attribute_is_not_found() {
        let dir = scratch_dir("missing");
        let result: Result<u64> = parse_value(&dir.join("vdz"), "size");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
    }
}
