//! Vultr CSI plugin.
//!
//! Implementation of gRPC methods from the CSI spec for Vultr block
//! storage (virtio disks) and Vultr file system (virtio-fs) volumes.
//! The controller half provisions and attaches volumes through the cloud
//! inventory API; the node half formats, stages and publishes them on the
//! compute instance it runs on.

#[macro_use]
extern crate tracing;

#[allow(dead_code)]
#[allow(clippy::type_complexity)]
#[allow(clippy::unit_arg)]
#[allow(clippy::redundant_closure)]
#[allow(clippy::enum_variant_names)]
#[allow(clippy::upper_case_acronyms)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

// Shortcut for building a grpc error status and logging it on the way out.
#[macro_export]
macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); Status::new(Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); Status::new(Code::$code, message) }};
}

mod block_vol;
pub mod cloud;
pub mod config;
pub mod context;
pub mod controller;
mod dev;
mod error;
mod format;
pub mod identity;
pub mod instance;
pub(crate) mod locks;
mod mount;
pub mod node;
mod resize;
pub(crate) mod retry;
mod vfs_vol;

/// Upper bound of attached block volumes per compute instance, dictated by
/// the number of virtio slots the hypervisor exposes.
pub const MAX_VOLS_PER_NODE: usize = 11;

/// Topology segment key advertised by the node and matched by the
/// controller when scheduling volumes.
pub const TOPOLOGY_REGION_KEY: &str = "region";

pub(crate) const GIB: u64 = 1024 * 1024 * 1024;
