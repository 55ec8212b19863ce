//! mountbox: removable media and archive mount orchestration
//! Mounts block devices and archive files under fixed roots, directly through
//! the kernel or through sandboxed FUSE daemons
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::platform`]: Syscall boundary (mount, umount2, directories, users)
//! - [`kernel::process`]: Sandboxed daemon launcher (namespaces, bind mounts, credentials)
//! - [`kernel::namespace`]: Mount and network namespace entry
//! - [`kernel::capabilities`]: Bounding and ambient set drop
//! - [`kernel::credentials`]: UID/GID validation and transition
//! - [`kernel::mountinfo`]: `/proc/self/mountinfo` parsing
//! - [`kernel::release`]: Running kernel version and driver gating
//!
//! ## Mount Orchestration ([`mount`])
//! - [`mount::options`]: Option-string algebra
//! - [`mount::point`]: One active or placeholder mount
//! - [`mount::mounter`]: Direct kernel mounter
//! - [`mount::fuse`]: FUSE mounter and block-device daemon preparer
//! - [`mount::archive`]: Archive daemon preparer
//! - [`mount::manager`]: Generic cache/reservation manager
//! - [`mount::disk`]: Removable disk backend
//! - [`mount::archive_manager`]: Archive backend
//!
//! ## Devices and Dispatch
//! - [`device`]: Disk snapshots, disk monitor and ejector seams
//! - [`dispatch`]: Event queue for daemon exits and periodic cleanup
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: Manager configuration loading and validation
//! - [`config::types`]: Error codes and shared types
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::fakes`]: In-memory platform, processes, disks and metrics
//!
//! # Design Principles
//!
//! 1. **One thread owns the state** - Caches are touched only by the dispatch thread
//! 2. **Kernel as truth** - Stale mounts are found in `/proc/self/mountinfo`
//! 3. **Ownership is unmount** - Dropping a mounted `MountPoint` unmounts it
//! 4. **Daemons run confined** - No root, no capabilities, private namespaces

// Kernel Primitives
pub mod kernel;

// Mount Orchestration
pub mod mount;

// Devices and Dispatch
pub mod device;
pub mod dispatch;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// Re-export commonly used types for convenience
pub use config::types::*;

pub use config::settings::ManagerConfig;
pub use dispatch::{Event, EventQueue};
pub use mount::{ArchiveManager, DiskManager, MountManager, MountOutcome};
