//! Mount orchestration
//!
//! Leaf to root: option algebra, mount points, mounters, then the generic
//! manager and its disk and archive backends.

pub mod archive;
pub mod archive_manager;
pub mod disk;
pub mod fuse;
pub mod manager;
pub mod mounter;
pub mod options;
pub mod point;

pub use archive_manager::{ArchiveManager, ArchiveManagerDeps};
pub use disk::{DiskManager, DiskManagerDeps};
pub use manager::{MountBackend, MountCompletion, MountManager, MountOutcome};
pub use point::{MountPoint, MountPointData};
