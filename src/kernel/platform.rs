/// Host syscall boundary for mount orchestration
///
/// Everything above this trait is pure bookkeeping; everything below it touches
/// the kernel. Tests substitute `testing::fakes::FakePlatform`.
use crate::config::types::{MountError, MountResult};
use crate::kernel::mountinfo;
use crate::kernel::namespace;
use crate::mount::options::MountFlags;
use nix::mount::MntFlags;
use std::collections::HashSet;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Kernel and filesystem operations used by mounters and managers
pub trait Platform {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        filesystem_type: &str,
        flags: MountFlags,
        data: &str,
    ) -> MountResult<()>;

    /// Single umount2(2) call; escalation policy belongs to the caller
    fn unmount(&self, path: &Path, flags: MntFlags) -> MountResult<()>;

    fn create_directory(&self, path: &Path) -> MountResult<()>;

    /// Create `path`, or accept it when it already exists as an empty directory
    fn create_or_reuse_empty_directory(&self, path: &Path) -> MountResult<()>;

    /// Like `create_or_reuse_empty_directory`, trying `"<path> (N)"` for
    /// N in 1..=max_suffix when the plain path is taken or reserved.
    /// Returns the directory actually used.
    fn create_or_reuse_empty_directory_with_fallback(
        &self,
        path: &Path,
        max_suffix: u32,
        reserved_paths: &HashSet<PathBuf>,
    ) -> MountResult<PathBuf> {
        if !reserved_paths.contains(path) && self.create_or_reuse_empty_directory(path).is_ok() {
            return Ok(path.to_path_buf());
        }

        for suffix in 1..=max_suffix {
            let candidate = PathBuf::from(format!("{} ({})", path.display(), suffix));
            if reserved_paths.contains(&candidate) {
                continue;
            }
            if self.create_or_reuse_empty_directory(&candidate).is_ok() {
                return Ok(candidate);
            }
        }

        log::error!(
            "Cannot create a mount directory for {} after {} attempts",
            path.display(),
            max_suffix + 1
        );
        Err(MountError::DirectoryCreationFailed)
    }

    fn remove_empty_directory(&self, path: &Path) -> MountResult<()>;

    fn set_ownership(&self, path: &Path, user_id: u32, group_id: u32) -> MountResult<()>;

    fn set_permissions(&self, path: &Path, mode: u32) -> MountResult<()>;

    fn get_user_and_group_id(&self, user_name: &str) -> Option<(u32, u32)>;

    fn get_group_id(&self, group_name: &str) -> Option<u32>;

    fn path_exists(&self, path: &Path) -> bool;

    fn directory_exists(&self, path: &Path) -> bool;

    fn get_real_path(&self, path: &Path) -> Option<PathBuf>;

    /// Immediate children of a directory; empty when unreadable
    fn list_directory(&self, path: &Path) -> Vec<PathBuf>;

    /// Mount points currently attached strictly below `root`
    fn mounted_paths_under(&self, root: &Path) -> Vec<PathBuf>;

    fn open_fuse_device(&self) -> MountResult<File>;

    /// Whether `path` is visible inside the mount namespace at `namespace`
    fn path_exists_in_mount_namespace(&self, namespace: &Path, path: &Path) -> bool;
}

/// `Platform` backed by real syscalls
#[derive(Clone, Debug, Default)]
pub struct SystemPlatform;

impl SystemPlatform {
    pub fn new() -> Self {
        Self
    }
}

fn to_cstring(value: &[u8]) -> MountResult<CString> {
    CString::new(value).map_err(|_| MountError::InvalidArgument)
}

fn io_to_mount_error(err: &std::io::Error) -> MountError {
    err.raw_os_error()
        .map(|code| MountError::from(nix::errno::Errno::from_raw(code)))
        .unwrap_or(MountError::Internal)
}

impl Platform for SystemPlatform {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        filesystem_type: &str,
        flags: MountFlags,
        data: &str,
    ) -> MountResult<()> {
        let source_cstr = to_cstring(source.as_bytes())?;
        let target_cstr = to_cstring(target.as_os_str().as_bytes())?;
        let fstype_cstr = to_cstring(filesystem_type.as_bytes())?;
        let data_cstr = to_cstring(data.as_bytes())?;

        // SAFETY: all pointers come from live CStrings owned by this frame.
        let result = unsafe {
            libc::mount(
                source_cstr.as_ptr(),
                target_cstr.as_ptr(),
                fstype_cstr.as_ptr(),
                flags,
                data_cstr.as_ptr() as *const libc::c_void,
            )
        };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            log::error!(
                "Cannot mount {} of type {} at {} (flags {:#x}): {}",
                source,
                filesystem_type,
                target.display(),
                flags,
                err
            );
            return Err(io_to_mount_error(&err));
        }

        log::info!(
            "Mounted {} of type {} at {}",
            source,
            filesystem_type,
            target.display()
        );
        Ok(())
    }

    fn unmount(&self, path: &Path, flags: MntFlags) -> MountResult<()> {
        match nix::mount::umount2(path, flags | MntFlags::UMOUNT_NOFOLLOW) {
            Ok(()) => {
                log::info!("Unmounted {} (flags {:?})", path.display(), flags);
                Ok(())
            }
            Err(nix::errno::Errno::EINVAL) => {
                log::warn!("{} is not a mount point", path.display());
                Err(MountError::PathNotMounted)
            }
            Err(errno) => {
                log::warn!("Cannot unmount {}: {}", path.display(), errno);
                Err(MountError::from(errno))
            }
        }
    }

    fn create_directory(&self, path: &Path) -> MountResult<()> {
        fs::create_dir(path).map_err(|e| {
            log::error!("Cannot create directory {}: {}", path.display(), e);
            MountError::DirectoryCreationFailed
        })
    }

    fn create_or_reuse_empty_directory(&self, path: &Path) -> MountResult<()> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let is_empty_dir = fs::read_dir(path)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false);
                if is_empty_dir {
                    Ok(())
                } else {
                    log::debug!("Directory {} exists and is not empty", path.display());
                    Err(MountError::DirectoryCreationFailed)
                }
            }
            Err(e) => {
                log::error!("Cannot create directory {}: {}", path.display(), e);
                Err(MountError::DirectoryCreationFailed)
            }
        }
    }

    fn remove_empty_directory(&self, path: &Path) -> MountResult<()> {
        fs::remove_dir(path).map_err(|e| {
            log::warn!("Cannot remove directory {}: {}", path.display(), e);
            io_to_mount_error(&e)
        })
    }

    fn set_ownership(&self, path: &Path, user_id: u32, group_id: u32) -> MountResult<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(user_id)),
            Some(nix::unistd::Gid::from_raw(group_id)),
        )
        .map_err(|errno| {
            log::error!(
                "Cannot change ownership of {} to {}:{}: {}",
                path.display(),
                user_id,
                group_id,
                errno
            );
            MountError::from(errno)
        })
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> MountResult<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            log::error!("Cannot set mode {:o} on {}: {}", mode, path.display(), e);
            io_to_mount_error(&e)
        })
    }

    fn get_user_and_group_id(&self, user_name: &str) -> Option<(u32, u32)> {
        match nix::unistd::User::from_name(user_name) {
            Ok(Some(user)) => Some((user.uid.as_raw(), user.gid.as_raw())),
            Ok(None) => {
                log::debug!("No such user: {}", user_name);
                None
            }
            Err(errno) => {
                log::warn!("Cannot look up user {}: {}", user_name, errno);
                None
            }
        }
    }

    fn get_group_id(&self, group_name: &str) -> Option<u32> {
        match nix::unistd::Group::from_name(group_name) {
            Ok(group) => group.map(|g| g.gid.as_raw()),
            Err(errno) => {
                log::warn!("Cannot look up group {}: {}", group_name, errno);
                None
            }
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn get_real_path(&self, path: &Path) -> Option<PathBuf> {
        fs::canonicalize(path).ok()
    }

    fn list_directory(&self, path: &Path) -> Vec<PathBuf> {
        match fs::read_dir(path) {
            Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
            Err(e) => {
                log::debug!("Cannot list {}: {}", path.display(), e);
                Vec::new()
            }
        }
    }

    fn mounted_paths_under(&self, root: &Path) -> Vec<PathBuf> {
        match mountinfo::parse_mountinfo() {
            Ok(entries) => mountinfo::mount_points_under(&entries, root),
            Err(e) => {
                log::warn!("Cannot read mount table: {}", e);
                Vec::new()
            }
        }
    }

    fn open_fuse_device(&self) -> MountResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/fuse")
            .map_err(|e| {
                log::error!("Cannot open /dev/fuse: {}", e);
                MountError::Internal
            })
    }

    fn path_exists_in_mount_namespace(&self, namespace: &Path, path: &Path) -> bool {
        let probe = path.to_path_buf();
        match namespace::run_in_mount_namespace(namespace, move || probe.exists()) {
            Ok(exists) => exists,
            Err(e) => {
                log::warn!(
                    "Cannot enter mount namespace {}: {}",
                    namespace.display(),
                    e
                );
                false
            }
        }
    }
}
