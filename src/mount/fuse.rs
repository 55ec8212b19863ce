//! FUSE mounts served by sandboxed daemons.
//!
//! The kernel side is mounted here against an open `/dev/fuse`; the daemon
//! receives the descriptor as `/dev/fd/N` and reports readiness by exiting
//! its launcher process.

use crate::config::types::{MountError, MountResult};
use crate::kernel::platform::Platform;
use crate::kernel::process::{SandboxedProcess, SandboxedProcessFactory};
use crate::mount::mounter::{Mounter, BASELINE_MOUNT_FLAGS};
use crate::mount::options::{is_read_only_mount, MountOptions};
use crate::mount::point::{MountPoint, MountPointData};
use crate::observability::metrics::Metrics;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Builds the common sandbox every FUSE daemon runs in
pub struct FuseSandboxFactory {
    platform: Rc<dyn Platform>,
    process_factory: Rc<dyn SandboxedProcessFactory>,
    executable: PathBuf,
    user_id: u32,
    group_id: u32,
    supplementary_groups: Vec<u32>,
    seccomp_policy: Option<PathBuf>,
    network_access: bool,
    mount_namespace: Option<PathBuf>,
}

impl FuseSandboxFactory {
    /// `None` when `run_as_user` does not resolve
    pub fn new(
        platform: Rc<dyn Platform>,
        process_factory: Rc<dyn SandboxedProcessFactory>,
        executable: &Path,
        run_as_user: &str,
    ) -> Option<Self> {
        let Some((user_id, group_id)) = platform.get_user_and_group_id(run_as_user) else {
            log::warn!(
                "User {} for {} does not exist",
                run_as_user,
                executable.display()
            );
            return None;
        };
        Some(Self {
            platform,
            process_factory,
            executable: executable.to_path_buf(),
            user_id,
            group_id,
            supplementary_groups: Vec::new(),
            seccomp_policy: None,
            network_access: false,
            mount_namespace: None,
        })
    }

    pub fn with_supplementary_groups(mut self, group_ids: Vec<u32>) -> Self {
        self.supplementary_groups = group_ids;
        self
    }

    pub fn with_seccomp_policy(mut self, policy: Option<PathBuf>) -> Self {
        self.seccomp_policy = policy;
        self
    }

    pub fn with_network_access(mut self, network_access: bool) -> Self {
        self.network_access = network_access;
        self
    }

    pub fn with_mount_namespace(mut self, namespace: Option<PathBuf>) -> Self {
        self.mount_namespace = namespace;
        self
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn create_sandboxed_process(&self) -> MountResult<Box<dyn SandboxedProcess>> {
        if !self.platform.path_exists(&self.executable) {
            log::error!("Daemon {} is not installed", self.executable.display());
            return Err(MountError::MountProgramFailed);
        }

        let mut process = self.process_factory.create_sandboxed_process(&self.executable);
        process.set_user_id(self.user_id);
        process.set_group_id(self.group_id);
        if !self.supplementary_groups.is_empty() {
            process.set_supplementary_groups(&self.supplementary_groups);
        }
        if let Some(namespace) = &self.mount_namespace {
            if !process.enter_existing_mount_namespace(namespace) {
                return Err(MountError::Internal);
            }
        }
        process.new_mount_namespace();
        process.set_network_access(self.network_access);
        if let Some(policy) = &self.seccomp_policy {
            process.set_seccomp_policy(policy);
        }
        Ok(process)
    }
}

/// Daemon-specific half of a FUSE mount
pub trait SandboxPreparer {
    fn sandbox_factory(&self) -> &FuseSandboxFactory;

    fn can_mount(&self, source: &str, params: &[String]) -> Option<String>;

    /// Whether the daemon will serve `params` read-only; the kernel side
    /// follows this
    fn is_read_only(&self, params: &[String]) -> bool {
        is_read_only_mount(params)
    }

    /// Configured, not yet started daemon for `source`
    fn prepare_sandbox(
        &self,
        source: &str,
        target_path: &Path,
        params: Vec<String>,
    ) -> MountResult<Box<dyn SandboxedProcess>>;
}

/// Settings shared by every FUSE mounter
pub struct FuseMounterConfig {
    /// FUSE subtype (`exfat`, `archive`)
    pub filesystem_type: String,
    pub read_only: bool,
    pub metrics: Option<Rc<dyn Metrics>>,
    pub metrics_name: String,
    pub password_needed_exit_codes: Vec<i32>,
}

pub struct FuseMounter<P: SandboxPreparer> {
    platform: Rc<dyn Platform>,
    config: FuseMounterConfig,
    preparer: P,
}

impl<P: SandboxPreparer> FuseMounter<P> {
    pub fn new(platform: Rc<dyn Platform>, config: FuseMounterConfig, preparer: P) -> Self {
        Self {
            platform,
            config,
            preparer,
        }
    }

    pub fn preparer(&self) -> &P {
        &self.preparer
    }

    fn kernel_filesystem_type(&self, source: &str) -> String {
        if source.starts_with("/dev/") {
            format!("fuseblk.{}", self.config.filesystem_type)
        } else {
            format!("fuse.{}", self.config.filesystem_type)
        }
    }
}

impl<P: SandboxPreparer> Mounter for FuseMounter<P> {
    fn filesystem_type(&self) -> &str {
        &self.config.filesystem_type
    }

    fn can_mount(&self, source: &str, params: &[String]) -> Option<String> {
        self.preparer.can_mount(source, params)
    }

    fn mount(&self, source: &str, target_path: &Path, params: Vec<String>) -> MountResult<MountPoint> {
        let fuse_file = self.platform.open_fuse_device()?;
        let fd = fuse_file.as_raw_fd();
        let factory = self.preparer.sandbox_factory();

        let mut flags = BASELINE_MOUNT_FLAGS;
        if self.config.read_only || self.preparer.is_read_only(&params) {
            flags |= libc::MS_RDONLY;
        }

        let data = format!(
            "fd={},user_id={},group_id={},allow_other,default_permissions,rootmode={:o}",
            fd,
            factory.user_id(),
            factory.group_id(),
            libc::S_IFDIR
        );

        // Dropping `mount_point` on any later failure unmounts the kernel side.
        let mut mount_point = MountPoint::mount(
            MountPointData {
                mount_path: target_path.to_path_buf(),
                source: source.to_string(),
                filesystem_type: self.kernel_filesystem_type(source),
                flags,
                data,
                ..MountPointData::default()
            },
            self.platform.clone(),
        )?;

        let mut process = self.preparer.prepare_sandbox(source, target_path, params)?;
        process.add_argument(&format!("/dev/fd/{}", fd));
        process.preserve_file(fuse_file);

        let pid = process.start().map_err(|e| {
            log::error!(
                "Cannot start {} for {}: {}",
                factory.executable().display(),
                source,
                e
            );
            e
        })?;

        log::info!(
            "FUSE daemon {} (pid {}) serving {} at {}",
            factory.executable().display(),
            pid,
            source,
            target_path.display()
        );

        mount_point.set_process(
            process,
            self.config.metrics.clone(),
            &self.config.metrics_name,
            self.config.password_needed_exit_codes.clone(),
        );
        Ok(mount_point)
    }
}

/// Preparer for block-device daemons (exFAT, NTFS)
pub struct DriveFuseHelper {
    platform: Rc<dyn Platform>,
    sandbox_factory: FuseSandboxFactory,
    files_user_id: u32,
    files_group_id: u32,
    allowed_options: Vec<String>,
    allowed_option_prefixes: Vec<String>,
}

impl DriveFuseHelper {
    pub fn new(
        platform: Rc<dyn Platform>,
        sandbox_factory: FuseSandboxFactory,
        files_user_id: u32,
        files_group_id: u32,
    ) -> Self {
        Self {
            platform,
            sandbox_factory,
            files_user_id,
            files_group_id,
            allowed_options: Vec::new(),
            allowed_option_prefixes: Vec::new(),
        }
    }

    pub fn with_allowed_options(mut self, options: Vec<String>, prefixes: Vec<String>) -> Self {
        self.allowed_options = options;
        self.allowed_option_prefixes = prefixes;
        self
    }

    fn mount_options(&self, params: &[String]) -> MountOptions {
        let mut options = MountOptions::new();
        for option in &self.allowed_options {
            options.allow_option(option);
        }
        for prefix in &self.allowed_option_prefixes {
            options.allow_option_prefix(prefix);
        }
        options.initialize(
            params,
            false,
            &self.files_user_id.to_string(),
            &self.files_group_id.to_string(),
        );
        options
    }
}

impl SandboxPreparer for DriveFuseHelper {
    fn sandbox_factory(&self) -> &FuseSandboxFactory {
        &self.sandbox_factory
    }

    fn is_read_only(&self, params: &[String]) -> bool {
        self.mount_options(params).is_read_only_option_set()
    }

    fn can_mount(&self, source: &str, _params: &[String]) -> Option<String> {
        if source.starts_with("/dev/") {
            Some("disk".to_string())
        } else {
            None
        }
    }

    fn prepare_sandbox(
        &self,
        source: &str,
        _target_path: &Path,
        params: Vec<String>,
    ) -> MountResult<Box<dyn SandboxedProcess>> {
        let device = Path::new(source);
        if !source.starts_with("/dev/") || !self.platform.path_exists(device) {
            log::error!("Device {} is not accessible", source);
            return Err(MountError::InvalidDevicePath);
        }

        let options = self.mount_options(&params);
        let mut process = self.sandbox_factory.create_sandboxed_process()?;
        process.bind_mount(device, device, !options.is_read_only_option_set(), false)?;
        process.add_argument("-o");
        process.add_argument(&options.to_fuse_mounter_options());
        process.add_argument(source);
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fakes::{FakePlatform, FakeProcessFactory, PlatformCall};

    fn setup() -> (Rc<FakePlatform>, Rc<FakeProcessFactory>) {
        let platform = Rc::new(FakePlatform::with_default_users());
        platform.add_path(Path::new("/usr/sbin/mount.exfat-fuse"));
        platform.add_path(Path::new("/dev/sdb1"));
        (platform, Rc::new(FakeProcessFactory::new()))
    }

    fn exfat_mounter(
        platform: &Rc<FakePlatform>,
        processes: &Rc<FakeProcessFactory>,
    ) -> FuseMounter<DriveFuseHelper> {
        let factory = FuseSandboxFactory::new(
            platform.clone(),
            processes.clone(),
            Path::new("/usr/sbin/mount.exfat-fuse"),
            "fuse-exfat",
        )
        .unwrap();
        let helper = DriveFuseHelper::new(platform.clone(), factory, 1000, 1001)
            .with_allowed_options(vec!["dirsync".to_string()], vec!["umask=".to_string()]);
        FuseMounter::new(
            platform.clone(),
            FuseMounterConfig {
                filesystem_type: "exfat".to_string(),
                read_only: false,
                metrics: None,
                metrics_name: "exfat".to_string(),
                password_needed_exit_codes: Vec::new(),
            },
            helper,
        )
    }

    #[test]
    fn test_sandbox_factory_requires_user() {
        let (platform, processes) = setup();
        assert!(FuseSandboxFactory::new(
            platform.clone(),
            processes.clone(),
            Path::new("/usr/sbin/mount.exfat-fuse"),
            "nobody-here",
        )
        .is_none());
    }

    #[test]
    fn test_sandbox_factory_requires_executable() {
        let (platform, processes) = setup();
        let factory = FuseSandboxFactory::new(
            platform.clone(),
            processes.clone(),
            Path::new("/usr/bin/missing-daemon"),
            "fuse-exfat",
        )
        .unwrap();
        assert_eq!(
            factory.create_sandboxed_process().err(),
            Some(MountError::MountProgramFailed)
        );
    }

    #[test]
    fn test_drive_mount_end_to_end() {
        let (platform, processes) = setup();
        let mounter = exfat_mounter(&platform, &processes);

        let mp = mounter
            .mount(
                "/dev/sdb1",
                Path::new("/media/removable/USB Drive"),
                vec!["rw".to_string(), "umask=0022".to_string(), "exec".to_string()],
            )
            .unwrap();
        assert!(mp.is_in_progress());
        assert_eq!(mp.filesystem_type(), "fuseblk.exfat");
        assert_eq!(mp.process_id(), Some(100));

        let (_, _, _, flags, data) = platform.mount_calls()[0].clone();
        assert_eq!(flags, BASELINE_MOUNT_FLAGS);
        assert!(data.starts_with("fd="));
        assert!(data.ends_with(",user_id=300,group_id=300,allow_other,default_permissions,rootmode=40000"));

        let process = processes.last().unwrap();
        assert_eq!(process.user_id, Some(300));
        assert_eq!(process.group_id, Some(300));
        assert!(process.new_mount_namespace);
        assert!(!process.network_access);
        assert!(process.started);
        assert_eq!(
            process.bind_mounts,
            vec![(PathBuf::from("/dev/sdb1"), PathBuf::from("/dev/sdb1"), true, false)]
        );
        assert_eq!(process.arguments[0], "-o");
        assert_eq!(
            process.arguments[1],
            "umask=0022,rw,uid=1000,gid=1001,nodev,noexec,nosuid"
        );
        assert_eq!(process.arguments[2], "/dev/sdb1");
        assert!(process.arguments[3].starts_with("/dev/fd/"));
        assert_eq!(process.preserved_fds.len(), 1);
    }

    #[test]
    fn test_read_only_device_bind() {
        let (platform, processes) = setup();
        let mounter = exfat_mounter(&platform, &processes);
        let mp = mounter
            .mount("/dev/sdb1", Path::new("/media/removable/a"), vec!["ro".to_string()])
            .unwrap();
        assert!(mp.is_read_only());
        assert!(!processes.last().unwrap().bind_mounts[0].2);
    }

    #[test]
    fn test_drive_without_mode_option_is_read_only_throughout() {
        let (platform, processes) = setup();
        let mounter = exfat_mounter(&platform, &processes);
        let mp = mounter
            .mount("/dev/sdb1", Path::new("/media/removable/a"), Vec::new())
            .unwrap();
        assert!(mp.is_read_only());

        let (_, _, _, flags, _) = platform.mount_calls()[0].clone();
        assert_ne!(flags & libc::MS_RDONLY, 0);
        let process = processes.last().unwrap();
        assert!(process.arguments[1].starts_with("ro,"));
        assert!(!process.bind_mounts[0].2);
    }

    #[test]
    fn test_start_failure_unmounts_kernel_side() {
        let (platform, processes) = setup();
        let mounter = exfat_mounter(&platform, &processes);
        processes.fail_next_start(MountError::MountProgramFailed);

        let result = mounter.mount("/dev/sdb1", Path::new("/media/removable/a"), Vec::new());
        assert_eq!(result.err(), Some(MountError::MountProgramFailed));
        assert!(platform
            .calls()
            .iter()
            .any(|c| matches!(c, PlatformCall::Unmount(p, _) if p == Path::new("/media/removable/a"))));
        assert!(platform.mounted_targets().is_empty());
    }

    #[test]
    fn test_missing_device_unmounts_kernel_side() {
        let (platform, processes) = setup();
        let mounter = exfat_mounter(&platform, &processes);
        let result = mounter.mount("/dev/sdz9", Path::new("/media/removable/a"), Vec::new());
        assert_eq!(result.err(), Some(MountError::InvalidDevicePath));
        assert_eq!(platform.unmount_calls().len(), 1);
        assert!(processes.created().is_empty());
    }

    #[test]
    fn test_fuse_device_unavailable() {
        let (platform, processes) = setup();
        platform.set_fuse_device_available(false);
        let mounter = exfat_mounter(&platform, &processes);
        let result = mounter.mount("/dev/sdb1", Path::new("/media/removable/a"), Vec::new());
        assert_eq!(result.err(), Some(MountError::Internal));
        assert!(platform.mount_calls().is_empty());
    }
}
