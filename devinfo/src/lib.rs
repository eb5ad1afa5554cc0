//!
//! Inspection of the live kernel mount table. The plugin derives all of
//! its idempotency decisions from what the kernel currently has mounted,
//! so parsing /proc/mounts correctly (octal escapes included) matters.
pub mod mountinfo;

pub use mountinfo::{MountInfo, MountIter};
