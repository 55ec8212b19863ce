//! One active or placeholder mount.
//!
//! A `MountPoint` owns its kernel mount: dropping a mounted instance unmounts
//! it. Placeholders (`create_unmounted`) never touch the platform.

use crate::config::types::{MountError, MountResult, MountSourceType};
use crate::kernel::platform::Platform;
use crate::kernel::process::SandboxedProcess;
use crate::mount::options::MountFlags;
use crate::observability::metrics::Metrics;
use nix::mount::MntFlags;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Facts about one mount
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPointData {
    pub mount_path: PathBuf,
    pub source: String,
    pub source_type: MountSourceType,
    pub filesystem_type: String,
    pub flags: MountFlags,
    pub data: String,
    pub error: Option<MountError>,
}

impl MountPointData {
    pub fn is_read_only(&self) -> bool {
        self.flags & libc::MS_RDONLY != 0
    }
}

pub type EjectCallback = Box<dyn FnOnce()>;
pub type LauncherExitCallback = Box<dyn FnOnce(Option<MountError>)>;

pub struct MountPoint {
    data: MountPointData,
    platform: Option<Rc<dyn Platform>>,
    process: Option<Box<dyn SandboxedProcess>>,
    eject: Option<EjectCallback>,
    launcher_exit_callback: Option<LauncherExitCallback>,
    metrics: Option<Rc<dyn Metrics>>,
    metrics_name: String,
    password_needed_exit_codes: Vec<i32>,
    is_mounted: bool,
    must_remove_dir: bool,
    released: bool,
}

impl MountPoint {
    fn with_state(data: MountPointData, platform: Option<Rc<dyn Platform>>, is_mounted: bool) -> Self {
        Self {
            data,
            platform,
            process: None,
            eject: None,
            launcher_exit_callback: None,
            metrics: None,
            metrics_name: String::new(),
            password_needed_exit_codes: Vec::new(),
            is_mounted,
            must_remove_dir: false,
            released: false,
        }
    }

    /// Placeholder that never issues syscalls
    pub fn create_unmounted(data: MountPointData) -> Self {
        Self::with_state(data, None, false)
    }

    /// Wrap a mount already performed out of band
    pub fn new(data: MountPointData, platform: Rc<dyn Platform>) -> Self {
        Self::with_state(data, Some(platform), true)
    }

    /// Issue mount(2) and wrap the result
    pub fn mount(data: MountPointData, platform: Rc<dyn Platform>) -> MountResult<Self> {
        platform.mount(
            &data.source,
            &data.mount_path,
            &data.filesystem_type,
            data.flags,
            &data.data,
        )?;
        Ok(Self::new(data, platform))
    }

    /// Handle for a mount this process must not unmount; only `release()` is
    /// meaningful
    pub fn create_leaking(mount_path: &Path) -> Self {
        Self::with_state(
            MountPointData {
                mount_path: mount_path.to_path_buf(),
                ..MountPointData::default()
            },
            None,
            true,
        )
    }

    /// Unmount, escalating to force+detach when busy.
    ///
    /// On success the directory is removed (if owned) and the eject closure
    /// fires. On failure the mount stays mounted.
    pub fn unmount(&mut self) -> MountResult<()> {
        if self.released || !self.is_mounted {
            return Err(MountError::PathNotMounted);
        }
        let Some(platform) = self.platform.clone() else {
            log::error!(
                "Cannot unmount {}: no platform attached",
                self.data.mount_path.display()
            );
            return Err(MountError::Internal);
        };

        let path = self.data.mount_path.clone();
        match platform.unmount(&path, MntFlags::empty()) {
            Ok(()) | Err(MountError::PathNotMounted) => {}
            Err(MountError::PathAlreadyMounted) => {
                log::warn!("{} is busy, forcing a lazy unmount", path.display());
                match platform.unmount(&path, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH) {
                    Ok(()) | Err(MountError::PathNotMounted) => {}
                    Err(e) => {
                        log::error!("Cannot force unmount {}: {}", path.display(), e);
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                log::error!("Cannot unmount {}: {}", path.display(), e);
                return Err(e);
            }
        }

        self.is_mounted = false;

        if self.must_remove_dir {
            if platform.remove_empty_directory(&path).is_ok() {
                self.must_remove_dir = false;
            }
        }

        if let Some(eject) = self.eject.take() {
            eject();
        }
        Ok(())
    }

    /// Reissue the mount with MS_REMOUNT; flags change only on success
    pub fn remount(&mut self, read_only: bool) -> MountResult<()> {
        if self.released || !self.is_mounted {
            return Err(MountError::PathNotMounted);
        }
        let Some(platform) = self.platform.clone() else {
            return Err(MountError::Internal);
        };

        let mut flags = self.data.flags;
        if read_only {
            flags |= libc::MS_RDONLY;
        } else {
            flags &= !libc::MS_RDONLY;
        }

        platform.mount(
            &self.data.source,
            &self.data.mount_path,
            &self.data.filesystem_type,
            flags | libc::MS_REMOUNT,
            &self.data.data,
        )?;

        self.data.flags = flags;
        log::info!(
            "Remounted {} {}",
            self.data.mount_path.display(),
            if read_only { "read-only" } else { "read-write" }
        );
        Ok(())
    }

    /// Attach the closure run after a successful unmount; at most once
    pub fn set_eject(&mut self, eject: EjectCallback) {
        if self.eject.is_some() {
            log::warn!(
                "Eject for {} already set, ignoring",
                self.data.mount_path.display()
            );
            return;
        }
        self.eject = Some(eject);
    }

    pub fn set_source_type(&mut self, source_type: MountSourceType) {
        self.data.source_type = source_type;
    }

    pub fn set_must_remove_dir(&mut self, must_remove_dir: bool) {
        self.must_remove_dir = must_remove_dir;
    }

    pub fn set_launcher_exit_callback(&mut self, callback: LauncherExitCallback) {
        self.launcher_exit_callback = Some(callback);
    }

    /// Attach the daemon serving this mount; the mount is in progress until
    /// `on_launcher_exit`
    pub fn set_process(
        &mut self,
        process: Box<dyn SandboxedProcess>,
        metrics: Option<Rc<dyn Metrics>>,
        metrics_name: &str,
        password_needed_exit_codes: Vec<i32>,
    ) {
        self.process = Some(process);
        self.metrics = metrics;
        self.metrics_name = metrics_name.to_string();
        self.password_needed_exit_codes = password_needed_exit_codes;
        self.data.error = Some(MountError::InProgress);
    }

    /// Resolve the pending status from the daemon's exit code
    pub fn on_launcher_exit(&mut self, exit_code: i32) -> Option<MountError> {
        let error = if exit_code == 0 {
            None
        } else if self.password_needed_exit_codes.contains(&exit_code) {
            Some(MountError::NeedPassword)
        } else {
            Some(MountError::MountProgramFailed)
        };

        if self.data.error != Some(MountError::InProgress) {
            log::warn!(
                "Daemon for {} exited with code {} after the mount was resolved",
                self.data.mount_path.display(),
                exit_code
            );
        }

        if let Some(metrics) = &self.metrics {
            if !self.metrics_name.is_empty() {
                metrics.record_daemon_exit_code(&self.metrics_name, exit_code);
            }
        }

        self.data.error = error;
        match error {
            None => log::info!("{} is ready", self.data.mount_path.display()),
            Some(e) => log::error!(
                "Daemon for {} failed with code {}: {}",
                self.data.mount_path.display(),
                exit_code,
                e
            ),
        }

        if let Some(callback) = self.launcher_exit_callback.take() {
            callback(error);
        }
        error
    }

    /// Give up ownership; the kernel mount outlives this handle
    pub fn release(&mut self) {
        self.released = true;
        self.is_mounted = false;
        self.must_remove_dir = false;
        self.eject = None;
    }

    pub fn data(&self) -> &MountPointData {
        &self.data
    }

    pub fn path(&self) -> &Path {
        &self.data.mount_path
    }

    pub fn source(&self) -> &str {
        &self.data.source
    }

    pub fn source_type(&self) -> MountSourceType {
        self.data.source_type
    }

    pub fn filesystem_type(&self) -> &str {
        &self.data.filesystem_type
    }

    pub fn flags(&self) -> MountFlags {
        self.data.flags
    }

    pub fn mount_data(&self) -> &str {
        &self.data.data
    }

    pub fn error(&self) -> Option<MountError> {
        self.data.error
    }

    pub fn is_mounted(&self) -> bool {
        self.is_mounted
    }

    pub fn is_read_only(&self) -> bool {
        self.data.is_read_only()
    }

    pub fn is_in_progress(&self) -> bool {
        self.data.error == Some(MountError::InProgress)
    }

    pub fn must_remove_dir(&self) -> bool {
        self.must_remove_dir
    }

    pub fn process_id(&self) -> Option<i32> {
        self.process.as_ref().and_then(|p| p.pid())
    }
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountPoint")
            .field("data", &self.data)
            .field("is_mounted", &self.is_mounted)
            .field("must_remove_dir", &self.must_remove_dir)
            .field("pid", &self.process_id())
            .finish()
    }
}

impl Drop for MountPoint {
    fn drop(&mut self) {
        if self.is_mounted && !self.released && self.platform.is_some() {
            let _ = self.unmount();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fakes::{FakePlatform, FakeProcess, PlatformCall, RecordingMetrics};
    use std::cell::Cell;

    fn data(path: &str) -> MountPointData {
        MountPointData {
            mount_path: PathBuf::from(path),
            source: "/dev/sdb1".to_string(),
            source_type: MountSourceType::RemovableDevice,
            filesystem_type: "vfat".to_string(),
            flags: libc::MS_NODEV | libc::MS_NOSUID,
            data: "utf8".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_mount_and_unmount() {
        let platform = Rc::new(FakePlatform::new());
        let mut mp = MountPoint::mount(data("/media/removable/disk"), platform.clone()).unwrap();
        assert!(mp.is_mounted());
        assert_eq!(platform.mounted_targets(), vec![PathBuf::from("/media/removable/disk")]);

        assert!(mp.unmount().is_ok());
        assert!(!mp.is_mounted());
        assert_eq!(mp.unmount(), Err(MountError::PathNotMounted));
        assert_eq!(platform.unmount_calls().len(), 1);
    }

    #[test]
    fn test_failed_mount_returns_error() {
        let platform = Rc::new(FakePlatform::new());
        platform.push_mount_error(MountError::InsufficientPermissions);
        let result = MountPoint::mount(data("/media/removable/disk"), platform.clone());
        assert_eq!(result.err(), Some(MountError::InsufficientPermissions));
    }

    #[test]
    fn test_busy_unmount_escalates_to_force_detach() {
        let platform = Rc::new(FakePlatform::new());
        let mut mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
        platform.push_unmount_error(MountError::PathAlreadyMounted);

        assert!(mp.unmount().is_ok());
        let calls = platform.unmount_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, MntFlags::empty());
        assert_eq!(calls[1].1, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH);
    }

    #[test]
    fn test_failed_unmount_stays_mounted() {
        let platform = Rc::new(FakePlatform::new());
        let mut mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
        platform.push_unmount_error(MountError::InsufficientPermissions);

        assert_eq!(mp.unmount(), Err(MountError::InsufficientPermissions));
        assert!(mp.is_mounted());
        assert!(mp.unmount().is_ok());
    }

    #[test]
    fn test_platform_not_mounted_counts_as_success() {
        let platform = Rc::new(FakePlatform::new());
        let mut mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
        platform.push_unmount_error(MountError::PathNotMounted);
        assert!(mp.unmount().is_ok());
        assert!(!mp.is_mounted());
    }

    #[test]
    fn test_unmount_removes_directory_then_ejects_once() {
        let platform = Rc::new(FakePlatform::new());
        let ejected = Rc::new(Cell::new(0));
        let mut mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
        mp.set_must_remove_dir(true);

        let counter = ejected.clone();
        mp.set_eject(Box::new(move || counter.set(counter.get() + 1)));
        let ignored = ejected.clone();
        mp.set_eject(Box::new(move || ignored.set(100)));

        assert!(mp.unmount().is_ok());
        assert_eq!(ejected.get(), 1);
        assert!(platform
            .calls()
            .contains(&PlatformCall::RemoveDirectory(PathBuf::from("/media/removable/disk"))));
    }

    #[test]
    fn test_remount_keeps_flags_only_on_success() {
        let platform = Rc::new(FakePlatform::new());
        let mut mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
        assert!(!mp.is_read_only());

        assert!(mp.remount(true).is_ok());
        assert!(mp.is_read_only());
        let (_, _, _, flags, _) = platform.mount_calls().last().cloned().unwrap();
        assert_ne!(flags & libc::MS_REMOUNT, 0);
        assert_ne!(flags & libc::MS_RDONLY, 0);

        platform.push_mount_error(MountError::Internal);
        assert_eq!(mp.remount(false), Err(MountError::Internal));
        assert!(mp.is_read_only());
    }

    #[test]
    fn test_placeholder_never_touches_platform() {
        let mut mp = MountPoint::create_unmounted(MountPointData {
            error: Some(MountError::UnknownFilesystem),
            ..data("/media/removable/disk")
        });
        assert!(!mp.is_mounted());
        assert_eq!(mp.unmount(), Err(MountError::PathNotMounted));
        assert_eq!(mp.remount(true), Err(MountError::PathNotMounted));
    }

    #[test]
    fn test_drop_unmounts() {
        let platform = Rc::new(FakePlatform::new());
        {
            let _mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
        }
        assert_eq!(platform.unmount_calls().len(), 1);
    }

    #[test]
    fn test_release_detaches_ownership() {
        let platform = Rc::new(FakePlatform::new());
        {
            let mut mp = MountPoint::new(data("/media/removable/disk"), platform.clone());
            mp.release();
            assert_eq!(mp.unmount(), Err(MountError::PathNotMounted));
        }
        assert!(platform.unmount_calls().is_empty());
    }

    #[test]
    fn test_leaking_mount_point() {
        let mut mp = MountPoint::create_leaking(Path::new("/media/archive/a.zip"));
        assert!(mp.is_mounted());
        assert_eq!(mp.unmount(), Err(MountError::Internal));
        mp.release();
        assert_eq!(mp.unmount(), Err(MountError::PathNotMounted));
    }

    #[test]
    fn test_launcher_exit_codes() {
        let platform = Rc::new(FakePlatform::new());
        let metrics = Rc::new(RecordingMetrics::new());

        for (code, expected) in [
            (0, None),
            (36, Some(MountError::NeedPassword)),
            (1, Some(MountError::MountProgramFailed)),
        ] {
            let mut mp = MountPoint::new(data("/media/archive/a.zip"), platform.clone());
            mp.set_process(
                Box::new(FakeProcess::with_pid(10)),
                Some(metrics.clone() as Rc<dyn Metrics>),
                "archivemount",
                vec![36, 37],
            );
            assert!(mp.is_in_progress());
            assert_eq!(mp.process_id(), Some(10));

            let seen = Rc::new(Cell::new(Some(MountError::InProgress)));
            let sink = seen.clone();
            mp.set_launcher_exit_callback(Box::new(move |status| sink.set(status)));

            assert_eq!(mp.on_launcher_exit(code), expected);
            assert_eq!(mp.error(), expected);
            assert_eq!(seen.get(), expected);
        }

        assert_eq!(
            metrics.daemon_exit_codes(),
            vec![
                ("archivemount".to_string(), 0),
                ("archivemount".to_string(), 36),
                ("archivemount".to_string(), 1)
            ]
        );
    }
}
