use std::{
    ffi::OsString,
    fmt::{self, Display, Formatter},
    fs::File,
    io::{self, BufRead, BufReader, Error, ErrorKind},
    os::unix::prelude::OsStringExt,
    path::{Path, PathBuf},
    str::FromStr,
};

/// A single entry from a mount-tab-like file. The source is kept verbatim,
/// which for virtio disks is a /dev path and for virtio-fs mounts is the
/// share tag itself.
#[derive(Debug, Default, Clone, Hash, Eq, PartialEq)]
pub struct MountInfo {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub fstype: String,
    pub options: Vec<String>,
}

impl Display for MountInfo {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(
            fmt,
            "{} on {} type {} ({})",
            self.source.display(),
            self.dest.display(),
            self.fstype,
            if self.options.is_empty() {
                "defaults".into()
            } else {
                self.options.join(",")
            },
        )
    }
}

impl MountInfo {
    /// True when the entry was mounted read-only.
    pub fn readonly(&self) -> bool {
        self.options.iter().any(|option| option == "ro")
    }

    // Paths with whitespace or other reserved characters appear in
    // /proc/mounts as three-digit octal escapes (e.g. "\040" for space).
    fn unescape(value: &str) -> io::Result<OsString> {
        let mut unescaped = Vec::with_capacity(value.len());
        let mut bytes = value.bytes();

        while let Some(byte) = bytes.next() {
            if byte != b'\\' {
                unescaped.push(byte);
                continue;
            }
            let mut code: u32 = 0;
            for _ in 0 .. 3 {
                let digit = bytes.next().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidData, "truncated octal escape")
                })?;
                let digit = (digit as char).to_digit(8).ok_or_else(|| {
                    Error::new(ErrorKind::InvalidData, "invalid octal escape")
                })?;
                code = code * 8 + digit;
            }
            unescaped.push(code as u8);
        }

        Ok(OsString::from_vec(unescaped))
    }
}

impl FromStr for MountInfo {
    type Err = io::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        fn missing(what: &'static str) -> Error {
            Error::new(ErrorKind::InvalidData, what)
        }

        let mut fields = line.split_whitespace();

        let source = fields.next().ok_or_else(|| missing("missing source"))?;
        let dest = fields.next().ok_or_else(|| missing("missing dest"))?;
        let fstype = fields.next().ok_or_else(|| missing("missing fstype"))?;
        let options = fields.next().ok_or_else(|| missing("missing options"))?;

        let source = PathBuf::from(MountInfo::unescape(source)?);
        let dest = PathBuf::from(MountInfo::unescape(dest)?);

        Ok(MountInfo {
            source,
            dest,
            fstype: fstype.to_owned(),
            options: options.split(',').map(String::from).collect(),
        })
    }
}

/// Iteratively parse a mount-tab-like file. Entries that fail to parse are
/// returned as errors rather than skipped: the caller decides whether a
/// malformed mount table is fatal.
pub struct MountIter<R> {
    reader: R,
    buffer: String,
}

impl MountIter<BufReader<File>> {
    pub fn new() -> io::Result<Self> {
        Self::new_from_file("/proc/mounts")
    }

    pub fn new_from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self::new_from_reader(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> MountIter<R> {
    /// Read mounts from any in-memory buffer.
    pub fn new_from_reader(readable: R) -> Self {
        Self {
            reader: readable,
            buffer: String::with_capacity(512),
        }
    }
}

impl<R: BufRead> Iterator for MountIter<R> {
    type Item = io::Result<MountInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buffer.clear();
            match self.reader.read_line(&mut self.buffer) {
                Ok(0) => return None,
                Ok(_) => {
                    let line = self.buffer.trim_start();
                    if !(line.is_empty() || line.starts_with('#')) {
                        return Some(MountInfo::from_str(line));
                    }
                }
                Err(why) => return Some(Err(why)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_device_entry() {
        let entry: MountInfo =
            "/dev/vda /mnt/staging ext4 rw,relatime,discard 0 0"
                .parse()
                .unwrap();
        assert_eq!(entry.source, PathBuf::from("/dev/vda"));
        assert_eq!(entry.dest, PathBuf::from("/mnt/staging"));
        assert_eq!(entry.fstype, "ext4");
        assert!(!entry.readonly());
        assert!(entry.options.contains(&"discard".to_string()));
    }

    #[test]
    fn parses_virtiofs_share_entry() {
        let entry: MountInfo = "ewr-share1 /mnt/vfs virtiofs rw,relatime 0 0"
            .parse()
            .unwrap();
        assert_eq!(entry.source, PathBuf::from("ewr-share1"));
        assert_eq!(entry.fstype, "virtiofs");
    }

    #[test]
    fn unescapes_octal_sequences() {
        let entry: MountInfo =
            "/dev/vdb /mnt/with\\040space ext4 ro,relatime 0 0"
                .parse()
                .unwrap();
        assert_eq!(entry.dest, PathBuf::from("/mnt/with space"));
        assert!(entry.readonly());
    }

    #[test]
    fn rejects_truncated_line() {
        assert!("/dev/vda /mnt/staging".parse::<MountInfo>().is_err());
    }

    #[test]
    fn iterates_over_reader() {
        let table = "\
# kernel mount table
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/vda /mnt/staging ext4 rw,relatime 0 0

ewr-share1 /mnt/vfs virtiofs rw,relatime 0 0
";
        let mounts: Vec<MountInfo> =
            MountIter::new_from_reader(std::io::Cursor::new(table))
                .collect::<io::Result<_>>()
                .unwrap();
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].dest, PathBuf::from("/mnt/staging"));
        assert_eq!(mounts[2].fstype, "virtiofs");
    }
}
