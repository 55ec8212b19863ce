/// Mount and network namespace primitives
///
/// Parent-side helpers may log. The `child_*` functions run between fork and
/// exec: they only issue raw syscalls on pre-built C strings and report
/// failure through `std::io::Error`.
use crate::config::types::{MountboxError, Result};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

/// Run `f` on a dedicated thread joined to the mount namespace at `namespace`.
///
/// setns(CLONE_NEWNS) refuses threads that share filesystem attributes, so
/// the helper thread first unshares CLONE_FS; the caller's namespace is never
/// touched.
pub fn run_in_mount_namespace<T, F>(namespace: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let ns_file = File::open(namespace).map_err(|e| {
        MountboxError::Io(io::Error::new(
            e.kind(),
            format!("Failed to open mount namespace {}: {}", namespace.display(), e),
        ))
    })?;

    let handle = std::thread::spawn(move || -> io::Result<T> {
        // SAFETY: unshare/setns only affect the calling helper thread.
        if unsafe { libc::unshare(libc::CLONE_FS) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setns(ns_file.as_raw_fd(), libc::CLONE_NEWNS) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(f())
    });

    match handle.join() {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(MountboxError::Io(e)),
        Err(_) => Err(MountboxError::Config(
            "mount namespace helper thread panicked".to_string(),
        )),
    }
}

/// Join an existing mount namespace (child side)
pub fn child_enter_mount_namespace(ns_fd: libc::c_int) -> io::Result<()> {
    // SAFETY: ns_fd was opened by the parent and survives fork.
    if unsafe { libc::setns(ns_fd, libc::CLONE_NEWNS) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// New mount namespace with `/` made recursively private so sandbox mounts
/// never propagate to the host (child side)
pub fn child_new_private_mount_namespace() -> io::Result<()> {
    // SAFETY: plain syscalls with constant arguments.
    if unsafe { libc::unshare(libc::CLONE_NEWNS) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let root = b"/\0";
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            root.as_ptr() as *const libc::c_char,
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Detach from the host network (child side)
pub fn child_new_network_namespace() -> io::Result<()> {
    // SAFETY: plain syscall with a constant argument.
    if unsafe { libc::unshare(libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind mount request prepared in the parent
#[derive(Debug, Clone)]
pub struct PreparedBindMount {
    pub source: CString,
    pub target: CString,
    pub writable: bool,
    pub recursive: bool,
}

/// Apply one bind mount; read-only binds are remounted because MS_RDONLY is
/// ignored on the initial bind (child side)
pub fn child_bind_mount(bind: &PreparedBindMount) -> io::Result<()> {
    let mut flags = libc::MS_BIND;
    if bind.recursive {
        flags |= libc::MS_REC;
    }
    // SAFETY: CStrings are owned by the closure captured before fork.
    let rc = unsafe {
        libc::mount(
            bind.source.as_ptr(),
            bind.target.as_ptr(),
            std::ptr::null(),
            flags,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    if !bind.writable {
        let rc = unsafe {
            libc::mount(
                std::ptr::null(),
                bind.target.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Check if mount namespaces are available on this system
pub fn is_supported() -> bool {
    Path::new("/proc/self/ns/mnt").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_in_own_mount_namespace() {
        if !is_supported() {
            return;
        }
        // Joining our own namespace needs CAP_SYS_ADMIN; accept either outcome
        // but never a panic.
        match run_in_mount_namespace(Path::new("/proc/self/ns/mnt"), || Path::new("/").exists()) {
            Ok(visible) => assert!(visible),
            Err(e) => println!("setns unavailable (expected without privileges): {}", e),
        }
    }

    #[test]
    fn test_missing_namespace_is_an_error() {
        let result = run_in_mount_namespace(Path::new("/nonexistent/ns/mnt"), || ());
        assert!(result.is_err());
    }
}
