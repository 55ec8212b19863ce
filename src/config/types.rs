/// Core types shared across the mount service
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Outcome codes of mount and unmount operations
///
/// Success is `Ok(())`; a mount point that has no pending or recorded failure
/// carries `None` in its error slot.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("invalid path")]
    InvalidPath,

    #[error("invalid device path")]
    InvalidDevicePath,

    #[error("invalid mount options")]
    InvalidMountOptions,

    #[error("directory creation failed")]
    DirectoryCreationFailed,

    #[error("unknown filesystem")]
    UnknownFilesystem,

    #[error("unsupported filesystem")]
    UnsupportedFilesystem,

    #[error("path already mounted")]
    PathAlreadyMounted,

    #[error("path not mounted")]
    PathNotMounted,

    #[error("mount program failed")]
    MountProgramFailed,

    #[error("password needed")]
    NeedPassword,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("internal error")]
    Internal,

    #[error("mount in progress")]
    InProgress,
}

impl MountError {
    /// Stable upper-case name used in audit records and metrics labels
    pub fn as_str(self) -> &'static str {
        match self {
            MountError::InvalidArgument => "INVALID_ARGUMENT",
            MountError::InvalidPath => "INVALID_PATH",
            MountError::InvalidDevicePath => "INVALID_DEVICE_PATH",
            MountError::InvalidMountOptions => "INVALID_MOUNT_OPTIONS",
            MountError::DirectoryCreationFailed => "DIRECTORY_CREATION_FAILED",
            MountError::UnknownFilesystem => "UNKNOWN_FILESYSTEM",
            MountError::UnsupportedFilesystem => "UNSUPPORTED_FILESYSTEM",
            MountError::PathAlreadyMounted => "PATH_ALREADY_MOUNTED",
            MountError::PathNotMounted => "PATH_NOT_MOUNTED",
            MountError::MountProgramFailed => "MOUNT_PROGRAM_FAILED",
            MountError::NeedPassword => "NEED_PASSWORD",
            MountError::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            MountError::Internal => "INTERNAL",
            MountError::InProgress => "IN_PROGRESS",
        }
    }
}

/// Result type for mount operations
pub type MountResult<T> = std::result::Result<T, MountError>;

impl From<nix::errno::Errno> for MountError {
    fn from(errno: nix::errno::Errno) -> Self {
        use nix::errno::Errno;
        match errno {
            Errno::EPERM | Errno::EACCES => MountError::InsufficientPermissions,
            Errno::EBUSY => MountError::PathAlreadyMounted,
            Errno::ENOENT | Errno::ENOTDIR => MountError::InvalidPath,
            Errno::ENOTBLK | Errno::ENXIO => MountError::InvalidDevicePath,
            Errno::ENODEV => MountError::UnsupportedFilesystem,
            Errno::EINVAL => MountError::InvalidArgument,
            _ => MountError::Internal,
        }
    }
}

/// Kind of source a mount point was created from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MountSourceType {
    /// Not yet classified (placeholders, leaking mounts)
    Invalid,
    /// Physical block device
    RemovableDevice,
    /// Archive file mounted through a FUSE daemon
    Archive,
}

impl Default for MountSourceType {
    fn default() -> Self {
        MountSourceType::Invalid
    }
}

/// Per-failure record produced by `unmount_all`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnmountFailure {
    pub mount_path: PathBuf,
    pub error: MountError,
}

/// Aggregated failures of a teardown pass
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{} mount point(s) failed to unmount", .failures.len())]
pub struct UnmountAllError {
    pub failures: Vec<UnmountFailure>,
}

/// Infrastructure errors: configuration loading and host I/O
#[derive(Error, Debug)]
pub enum MountboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),
}

/// Result type alias for infrastructure operations
pub type Result<T> = std::result::Result<T, MountboxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MountError::from(Errno::EACCES), MountError::InsufficientPermissions);
        assert_eq!(MountError::from(Errno::EPERM), MountError::InsufficientPermissions);
        assert_eq!(MountError::from(Errno::EBUSY), MountError::PathAlreadyMounted);
        assert_eq!(MountError::from(Errno::ENOENT), MountError::InvalidPath);
        assert_eq!(MountError::from(Errno::ENOTBLK), MountError::InvalidDevicePath);
        assert_eq!(MountError::from(Errno::ENODEV), MountError::UnsupportedFilesystem);
        assert_eq!(MountError::from(Errno::EIO), MountError::Internal);
    }

    #[test]
    fn test_error_names_are_stable() {
        assert_eq!(MountError::NeedPassword.as_str(), "NEED_PASSWORD");
        assert_eq!(MountError::InProgress.as_str(), "IN_PROGRESS");
    }

    #[test]
    fn test_unmount_all_error_message() {
        let err = UnmountAllError {
            failures: vec![UnmountFailure {
                mount_path: PathBuf::from("/media/removable/a"),
                error: MountError::Internal,
            }],
        };
        assert_eq!(err.to_string(), "1 mount point(s) failed to unmount");
    }
}
