//! Removable block devices.

use crate::config::settings::ManagerConfig;
use crate::config::types::{MountError, MountResult, MountSourceType};
use crate::device::{DeviceEjector, DiskMonitor};
use crate::kernel::platform::Platform;
use crate::kernel::process::SandboxedProcessFactory;
use crate::kernel::release::{kernel_driver_allowed, KernelVersion};
use crate::mount::fuse::{DriveFuseHelper, FuseMounter, FuseMounterConfig, FuseSandboxFactory};
use crate::mount::manager::{MountBackend, MountManager};
use crate::mount::mounter::{FatParams, Mounter, SystemMounter};
use crate::mount::options::{
    get_param_value, is_read_only_mount, remove_params_with_same_name, OPTION_READ_ONLY,
};
use crate::mount::point::MountPoint;
use crate::observability::metrics::Metrics;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

const PREFER_DRIVER_PARAM: &str = "prefer-driver";
const KERNEL_PREFIX: &str = "kernel-";
const FUSE_PREFIX: &str = "fuse-";

pub type DiskManager = MountManager<DiskBackend>;

/// Collaborators a `DiskManager` is built from
pub struct DiskManagerDeps {
    pub platform: Rc<dyn Platform>,
    pub process_factory: Rc<dyn SandboxedProcessFactory>,
    pub disk_monitor: Rc<dyn DiskMonitor>,
    pub ejector: Rc<dyn DeviceEjector>,
    pub metrics: Option<Rc<dyn Metrics>>,
    /// Kernel gating kernel-driver entries; `None` registers none of them
    pub running_kernel: Option<KernelVersion>,
}

pub struct DiskBackend {
    disk_monitor: Rc<dyn DiskMonitor>,
    ejector: Rc<dyn DeviceEjector>,
    metrics: Option<Rc<dyn Metrics>>,
    mounters: BTreeMap<String, Box<dyn Mounter>>,
    eject_suppressed: Rc<Cell<bool>>,
}

impl DiskBackend {
    pub fn new(
        disk_monitor: Rc<dyn DiskMonitor>,
        ejector: Rc<dyn DeviceEjector>,
        metrics: Option<Rc<dyn Metrics>>,
    ) -> Self {
        Self {
            disk_monitor,
            ejector,
            metrics,
            mounters: BTreeMap::new(),
            eject_suppressed: Rc::new(Cell::new(false)),
        }
    }

    /// Register `mounter` under a bare, `kernel-` or `fuse-` key
    pub fn register_mounter(&mut self, key: &str, mounter: Box<dyn Mounter>) {
        if self.mounters.insert(key.to_string(), mounter).is_some() {
            log::warn!("Mounter {} registered twice, keeping the last", key);
        }
    }

    pub fn has_mounter(&self, key: &str) -> bool {
        self.mounters.contains_key(key)
    }

    pub fn mounter_keys(&self) -> Vec<String> {
        self.mounters.keys().cloned().collect()
    }

    fn probe_order(filesystem_type: &str, preferred: Option<&str>) -> Vec<String> {
        let mut keys = vec![
            filesystem_type.to_string(),
            format!("{}{}", KERNEL_PREFIX, filesystem_type),
            format!("{}{}", FUSE_PREFIX, filesystem_type),
        ];
        let first = match preferred {
            Some("kernel") => Some(1),
            Some("fuse") => Some(2),
            Some(other) => {
                log::warn!("Ignoring unknown driver preference '{}'", other);
                None
            }
            None => None,
        };
        if let Some(index) = first {
            let key = keys.remove(index);
            keys.insert(0, key);
        }
        keys
    }

    fn select_mounter(&self, filesystem_type: &str, preferred: Option<&str>) -> Option<&dyn Mounter> {
        Self::probe_order(filesystem_type, preferred)
            .iter()
            .find_map(|key| self.mounters.get(key))
            .map(|mounter| mounter.as_ref())
    }
}

impl MountBackend for DiskBackend {
    fn name(&self) -> &str {
        "disk"
    }

    fn can_mount(&self, source: &str) -> bool {
        source.starts_with("/sys/") || source.starts_with("/devices/") || source.starts_with("/dev/")
    }

    fn suggest_mount_path(&self, source: &str, mount_root: &Path) -> PathBuf {
        match self.disk_monitor.get_disk_by_device_path(Path::new(source)) {
            Some(disk) => mount_root.join(disk.presentation_name()),
            None => {
                let name = Path::new(source)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                mount_root.join(name)
            }
        }
    }

    fn do_mount(
        &self,
        source: &str,
        filesystem_type: &str,
        mut options: Vec<String>,
        mount_path: &Path,
    ) -> MountResult<MountPoint> {
        let Some(disk) = self.disk_monitor.get_disk_by_device_path(Path::new(source)) else {
            log::error!("Unknown disk {}", source);
            return Err(MountError::InvalidDevicePath);
        };
        if disk.is_on_boot_device {
            log::error!("Refusing to mount {} on the boot device", source);
            return Err(MountError::InvalidDevicePath);
        }
        if disk.device_file.is_empty() {
            log::error!("Disk {} has no device file", source);
            return Err(MountError::InvalidDevicePath);
        }

        let filesystem_type = if filesystem_type.is_empty() {
            disk.filesystem_type.as_str()
        } else {
            filesystem_type
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_device_media_type(disk.media_type);
            metrics.record_filesystem_type(filesystem_type);
        }
        if filesystem_type.is_empty() {
            log::error!("Cannot detect the filesystem of {}", source);
            return Err(MountError::UnknownFilesystem);
        }

        let preferred = get_param_value(&options, PREFER_DRIVER_PARAM);
        remove_params_with_same_name(&mut options, PREFER_DRIVER_PARAM);

        let Some(mounter) = self.select_mounter(filesystem_type, preferred.as_deref()) else {
            log::error!("No mounter for filesystem {} of {}", filesystem_type, source);
            return Err(MountError::UnsupportedFilesystem);
        };

        if disk.is_read_only || disk.is_optical_disk() {
            options.push(OPTION_READ_ONLY.to_string());
        }

        let mut mount_point = match mounter.mount(&disk.device_file, mount_path, options.clone()) {
            Ok(mount_point) => mount_point,
            Err(error) if !is_read_only_mount(&options) => {
                log::warn!(
                    "Read-write mount of {} failed ({}), retrying read-only",
                    disk.device_file,
                    error
                );
                options.push(OPTION_READ_ONLY.to_string());
                let mount_point = mounter
                    .mount(&disk.device_file, mount_path, options)
                    .map_err(|retry_error| {
                        log::error!(
                            "Read-only mount of {} failed too: {}",
                            disk.device_file,
                            retry_error
                        );
                        error
                    })?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_read_only_fallback(filesystem_type);
                }
                mount_point
            }
            Err(error) => return Err(error),
        };

        mount_point.set_source_type(MountSourceType::RemovableDevice);

        if disk.is_optical_disk() {
            let ejector = self.ejector.clone();
            let suppressed = self.eject_suppressed.clone();
            let device_file = disk.device_file.clone();
            mount_point.set_eject(Box::new(move || {
                if suppressed.get() {
                    log::debug!("Not ejecting {} during teardown", device_file);
                    return;
                }
                if !ejector.eject(&device_file) {
                    log::warn!("Cannot eject {}", device_file);
                }
            }));
        }

        log::info!(
            "Mounted {} ({}) with {}",
            disk.device_file,
            filesystem_type,
            mounter.filesystem_type()
        );
        Ok(mount_point)
    }

    /// Read-only and optical media stay read-only whatever the caller asks
    fn do_remount(&self, mount_point: &mut MountPoint, options: &[String]) -> MountResult<()> {
        let mut read_only = is_read_only_mount(options);
        if !read_only {
            let disk = self
                .disk_monitor
                .get_disk_by_device_path(Path::new(mount_point.source()));
            if disk.map_or(false, |d| d.is_read_only || d.is_optical_disk()) {
                log::info!(
                    "{} can only be mounted read-only, keeping it read-only",
                    mount_point.source()
                );
                read_only = true;
            }
        }
        mount_point.remount(read_only)
    }

    fn should_reserve_mount_path_on_error(&self, error: MountError) -> bool {
        matches!(error, MountError::UnknownFilesystem | MountError::UnsupportedFilesystem)
    }

    fn begin_unmount_all(&self) {
        self.eject_suppressed.set(true);
    }

    fn end_unmount_all(&self) {
        self.eject_suppressed.set(false);
    }
}

fn files_user_options(user_id: Option<u32>, group_id: Option<u32>) -> Vec<String> {
    let mut options = Vec::new();
    if let Some(uid) = user_id {
        options.push(format!("uid={}", uid));
    }
    if let Some(gid) = group_id {
        options.push(format!("gid={}", gid));
    }
    options
}

impl DiskManager {
    /// Build the mounter registry described by `config`
    pub fn from_config(config: &ManagerConfig, deps: DiskManagerDeps) -> Self {
        let platform = deps.platform.clone();
        let files_user_id = platform.get_user_and_group_id(&config.files_user).map(|(uid, _)| uid);
        let files_group_id = platform.get_group_id(&config.files_group);
        if files_user_id.is_none() || files_group_id.is_none() {
            log::warn!(
                "Files user {}:{} does not resolve; mounts will not set uid/gid",
                config.files_user,
                config.files_group
            );
        }

        let mut backend = DiskBackend::new(deps.disk_monitor, deps.ejector, deps.metrics.clone());

        for entry in &config.system_filesystems {
            let mut options = entry.options.clone();
            if entry.files_user_ids {
                options.extend(files_user_options(files_user_id, files_group_id));
            }
            let mut mounter = SystemMounter::new(platform.clone(), &entry.name, entry.read_only, options);
            if entry.fat_time_offset {
                mounter = mounter.with_params_parser(Box::new(FatParams));
            }
            backend.register_mounter(&entry.name, Box::new(mounter));
        }

        for entry in &config.kernel_drivers {
            let Some(minimum) = KernelVersion::parse(&entry.minimum_kernel) else {
                log::warn!(
                    "Bad minimum kernel '{}' for {}, skipping",
                    entry.minimum_kernel,
                    entry.filesystem
                );
                continue;
            };
            if !kernel_driver_allowed(deps.running_kernel, minimum, &config.release_channel, &entry.channels) {
                log::info!("Kernel driver for {} not enabled", entry.filesystem);
                continue;
            }
            let mut options = entry.options.clone();
            if entry.files_user_ids {
                options.extend(files_user_options(files_user_id, files_group_id));
            }
            let mounter = SystemMounter::new(platform.clone(), &entry.filesystem, false, options)
                .with_kernel_filesystem(&entry.kernel_filesystem);
            backend.register_mounter(&format!("{}{}", KERNEL_PREFIX, entry.filesystem), Box::new(mounter));
        }

        match (files_user_id, files_group_id) {
            (Some(uid), Some(gid)) => {
                for entry in &config.fuse_drivers {
                    let Some(factory) = FuseSandboxFactory::new(
                        platform.clone(),
                        deps.process_factory.clone(),
                        &entry.executable,
                        &entry.daemon_user,
                    ) else {
                        continue;
                    };
                    let groups: Vec<u32> = entry
                        .supplementary_groups
                        .iter()
                        .filter_map(|name| {
                            let id = platform.get_group_id(name);
                            if id.is_none() {
                                log::warn!("Group {} for {} does not exist", name, entry.filesystem);
                            }
                            id
                        })
                        .collect();
                    let factory = factory
                        .with_supplementary_groups(groups)
                        .with_seccomp_policy(entry.seccomp_policy.clone())
                        .with_network_access(entry.network_access);
                    let helper = DriveFuseHelper::new(platform.clone(), factory, uid, gid).with_allowed_options(
                        entry.allowed_options.clone(),
                        entry.allowed_option_prefixes.clone(),
                    );
                    let mounter = FuseMounter::new(
                        platform.clone(),
                        FuseMounterConfig {
                            filesystem_type: entry.filesystem.clone(),
                            read_only: entry.read_only,
                            metrics: deps.metrics.clone(),
                            metrics_name: entry.filesystem.clone(),
                            password_needed_exit_codes: Vec::new(),
                        },
                        helper,
                    );
                    backend.register_mounter(&format!("{}{}", FUSE_PREFIX, entry.filesystem), Box::new(mounter));
                }
            }
            _ => log::warn!("FUSE drivers disabled: files user does not resolve"),
        }

        log::info!("Disk mounters: {:?}", backend.mounter_keys());
        MountManager::new(
            backend,
            platform,
            &config.mount_root,
            config.max_mount_path_suffix,
            deps.metrics,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceMediaType, Disk};
    use crate::testing::fakes::{FakeDiskMonitor, FakeEjector, FakePlatform, FakeProcessFactory, RecordingMetrics};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        platform: Rc<FakePlatform>,
        processes: Rc<FakeProcessFactory>,
        disks: Rc<FakeDiskMonitor>,
        ejector: Rc<FakeEjector>,
        metrics: Rc<RecordingMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Self {
                platform: Rc::new(FakePlatform::with_default_users()),
                processes: Rc::new(FakeProcessFactory::new()),
                disks: Rc::new(FakeDiskMonitor::new()),
                ejector: Rc::new(FakeEjector::new()),
                metrics: Rc::new(RecordingMetrics::new()),
            }
        }

        fn manager_with(&self, config: &ManagerConfig, running_kernel: Option<KernelVersion>) -> DiskManager {
            DiskManager::from_config(
                config,
                DiskManagerDeps {
                    platform: self.platform.clone(),
                    process_factory: self.processes.clone(),
                    disk_monitor: self.disks.clone(),
                    ejector: self.ejector.clone(),
                    metrics: Some(self.metrics.clone() as Rc<dyn Metrics>),
                    running_kernel,
                },
            )
        }

        fn manager(&self) -> DiskManager {
            self.manager_with(&ManagerConfig::default(), Some(KernelVersion::new(6, 1)))
        }

        fn add_disk(&self, name: &str, filesystem_type: &str, media_type: DeviceMediaType) -> String {
            let device_path = format!("/sys/devices/pci0000:00/usb1/block/{}", name);
            self.disks.add_disk(Disk {
                device_path: device_path.clone(),
                device_file: format!("/dev/{}", name),
                filesystem_type: filesystem_type.to_string(),
                label: String::new(),
                uuid: format!("{}-uuid", name),
                media_type,
                ..Disk::default()
            });
            device_path
        }
    }

    #[test]
    fn test_registry_from_default_config() {
        let fx = Fixture::new();
        let manager = fx.manager();
        let backend = manager.backend();
        for key in ["vfat", "iso9660", "udf", "ext4", "kernel-exfat", "fuse-exfat", "fuse-ntfs"] {
            assert!(backend.has_mounter(key), "missing {}", key);
        }
        // ntfs3 is limited to pre-release channels.
        assert!(!backend.has_mounter("kernel-ntfs"));
    }

    #[test]
    fn test_kernel_drivers_gated() {
        let fx = Fixture::new();
        let old_kernel = fx.manager_with(&ManagerConfig::default(), Some(KernelVersion::new(5, 10)));
        assert!(!old_kernel.backend().has_mounter("kernel-exfat"));

        let config = ManagerConfig {
            release_channel: "beta".to_string(),
            ..ManagerConfig::default()
        };
        let beta = fx.manager_with(&config, Some(KernelVersion::new(6, 1)));
        assert!(beta.backend().has_mounter("kernel-ntfs"));
    }

    #[test]
    fn test_fuse_drivers_need_daemon_user() {
        let fx = Fixture::new();
        let platform = Rc::new(FakePlatform::new());
        platform.add_user("chronos", 1000, 1000);
        platform.add_group("chronos-access", 1001);
        let manager = DiskManager::from_config(
            &ManagerConfig::default(),
            DiskManagerDeps {
                platform,
                process_factory: fx.processes.clone(),
                disk_monitor: fx.disks.clone(),
                ejector: fx.ejector.clone(),
                metrics: None,
                running_kernel: None,
            },
        );
        assert!(!manager.backend().has_mounter("fuse-exfat"));
        assert!(!manager.backend().has_mounter("kernel-exfat"));
        assert!(manager.backend().has_mounter("vfat"));
    }

    #[test]
    fn test_probe_order() {
        assert_eq!(
            DiskBackend::probe_order("exfat", None),
            strings(&["exfat", "kernel-exfat", "fuse-exfat"])
        );
        assert_eq!(
            DiskBackend::probe_order("exfat", Some("fuse")),
            strings(&["fuse-exfat", "exfat", "kernel-exfat"])
        );
        assert_eq!(
            DiskBackend::probe_order("exfat", Some("kernel")),
            strings(&["kernel-exfat", "exfat", "fuse-exfat"])
        );
        assert_eq!(
            DiskBackend::probe_order("exfat", Some("other")),
            strings(&["exfat", "kernel-exfat", "fuse-exfat"])
        );
    }

    #[test]
    fn test_prefer_fuse_driver() {
        let fx = Fixture::new();
        fx.platform.add_path(Path::new("/usr/sbin/mount.exfat-fuse"));
        fx.platform.add_path(Path::new("/dev/sdb1"));
        let source = fx.add_disk("sdb1", "exfat", DeviceMediaType::Usb);
        let mut manager = fx.manager();

        let outcome = manager
            .mount(&source, "", strings(&["rw", "prefer-driver=fuse"]), None)
            .unwrap();
        assert!(outcome.in_progress);
        let process = fx.processes.last().unwrap();
        assert!(!process.arguments.iter().any(|a| a.contains("prefer-driver")));
        assert_eq!(fx.platform.mount_calls()[0].2, "fuseblk.exfat");
    }

    #[test]
    fn test_kernel_driver_used_by_default() {
        let fx = Fixture::new();
        let source = fx.add_disk("sdb1", "exfat", DeviceMediaType::Usb);
        let mut manager = fx.manager();
        manager.mount(&source, "", strings(&["rw"]), None).unwrap();

        let (device, _, fstype, _, data) = fx.platform.mount_calls()[0].clone();
        assert_eq!(device, "/dev/sdb1");
        assert_eq!(fstype, "exfat");
        assert_eq!(data, "iocharset=utf8,dmask=0027,fmask=0027,uid=1000,gid=1001");
        assert!(fx.processes.created().is_empty());
    }

    #[test]
    fn test_rejects_boot_and_unknown_devices() {
        let fx = Fixture::new();
        fx.disks.add_disk(Disk {
            device_path: "/sys/devices/boot/sda1".to_string(),
            device_file: "/dev/sda1".to_string(),
            filesystem_type: "ext4".to_string(),
            is_on_boot_device: true,
            ..Disk::default()
        });
        fx.disks.add_disk(Disk {
            device_path: "/sys/devices/gone/sdc1".to_string(),
            filesystem_type: "ext4".to_string(),
            ..Disk::default()
        });
        let mut manager = fx.manager();

        for source in ["/sys/devices/boot/sda1", "/sys/devices/gone/sdc1", "/sys/devices/none"] {
            assert_eq!(
                manager.mount(source, "", Vec::new(), None),
                Err(MountError::InvalidDevicePath)
            );
        }
        assert!(fx.platform.mount_calls().is_empty());
        assert!(manager.mount_points().is_empty());
    }

    #[test]
    fn test_unknown_filesystem_reserves_path() {
        let fx = Fixture::new();
        let source = fx.add_disk("sdb1", "", DeviceMediaType::Usb);
        let other = fx.add_disk("sdc1", "hfsplus", DeviceMediaType::Sd);
        let mut manager = fx.manager();

        assert_eq!(manager.mount(&source, "", Vec::new(), None), Err(MountError::UnknownFilesystem));
        assert!(manager.is_mount_path_reserved(Path::new("/media/removable/sdb1-uuid")));

        assert_eq!(manager.mount(&other, "", Vec::new(), None), Err(MountError::UnsupportedFilesystem));
        assert!(manager.is_mount_path_reserved(Path::new("/media/removable/sdc1-uuid")));
        assert_eq!(
            fx.metrics.media_types(),
            vec![DeviceMediaType::Usb, DeviceMediaType::Sd]
        );
    }

    #[test]
    fn test_read_only_fallback() {
        let fx = Fixture::new();
        let source = fx.add_disk("sdb1", "ext4", DeviceMediaType::Usb);
        fx.platform.push_mount_error(MountError::InsufficientPermissions);
        let mut manager = fx.manager();

        let outcome = manager.mount(&source, "", strings(&["rw"]), None).unwrap();
        assert!(outcome.read_only);
        assert_eq!(fx.platform.mount_calls().len(), 2);
        assert_eq!(fx.metrics.read_only_fallbacks(), vec!["ext4".to_string()]);
    }

    #[test]
    fn test_read_only_failure_is_not_retried() {
        let fx = Fixture::new();
        let source = fx.add_disk("sdb1", "ext4", DeviceMediaType::Usb);
        fx.platform.push_mount_error(MountError::InsufficientPermissions);
        let mut manager = fx.manager();

        assert_eq!(
            manager.mount(&source, "", strings(&["ro"]), None),
            Err(MountError::InsufficientPermissions)
        );
        assert_eq!(fx.platform.mount_calls().len(), 1);
        assert!(fx.metrics.read_only_fallbacks().is_empty());
    }

    #[test]
    fn test_optical_disc_forced_read_only_and_ejected() {
        let fx = Fixture::new();
        let source = fx.add_disk("sr0", "udf", DeviceMediaType::Dvd);
        let mut manager = fx.manager();

        let outcome = manager.mount(&source, "", strings(&["rw"]), None).unwrap();
        assert!(outcome.read_only);
        assert_eq!(outcome.mount_path, PathBuf::from("/media/removable/sr0-uuid"));
        assert_eq!(
            manager.find_mount_by_source(&source).unwrap().source_type(),
            MountSourceType::RemovableDevice
        );

        manager.unmount(&source).unwrap();
        assert_eq!(fx.ejector.ejected(), vec!["/dev/sr0".to_string()]);
    }

    #[test]
    fn test_remount_keeps_optical_disc_read_only() {
        let fx = Fixture::new();
        let source = fx.add_disk("sr0", "udf", DeviceMediaType::Dvd);
        let mut manager = fx.manager();
        manager.mount(&source, "", strings(&["rw"]), None).unwrap();

        let outcome = manager
            .mount(&source, "", strings(&["remount", "rw"]), None)
            .unwrap();
        assert!(outcome.read_only);
        let (_, _, _, flags, _) = fx.platform.mount_calls().last().cloned().unwrap();
        assert_ne!(flags & libc::MS_REMOUNT, 0);
        assert_ne!(flags & libc::MS_RDONLY, 0);
        assert!(manager.find_mount_by_source(&source).unwrap().is_read_only());
    }

    #[test]
    fn test_remount_keeps_write_protected_disk_read_only() {
        let fx = Fixture::new();
        fx.disks.add_disk(Disk {
            device_path: "/sys/devices/usb/block/sdb1".to_string(),
            device_file: "/dev/sdb1".to_string(),
            filesystem_type: "ext4".to_string(),
            media_type: DeviceMediaType::Sd,
            is_read_only: true,
            ..Disk::default()
        });
        let mut manager = fx.manager();
        let source = "/sys/devices/usb/block/sdb1";
        assert!(manager.mount(source, "", Vec::new(), None).unwrap().read_only);

        let outcome = manager.mount(source, "", strings(&["remount", "rw"]), None).unwrap();
        assert!(outcome.read_only);
    }

    #[test]
    fn test_remount_writable_disk_read_write() {
        let fx = Fixture::new();
        let source = fx.add_disk("sdb1", "ext4", DeviceMediaType::Usb);
        let mut manager = fx.manager();
        assert!(manager.mount(&source, "", strings(&["ro"]), None).unwrap().read_only);

        let outcome = manager.mount(&source, "", strings(&["remount", "rw"]), None).unwrap();
        assert!(!outcome.read_only);
    }

    #[test]
    fn test_failed_optical_unmount_keeps_eject_armed() {
        let fx = Fixture::new();
        let source = fx.add_disk("sr0", "iso9660", DeviceMediaType::OpticalDisc);
        let mut manager = fx.manager();
        manager.mount(&source, "", Vec::new(), None).unwrap();

        fx.platform.push_unmount_error(MountError::InsufficientPermissions);
        assert_eq!(manager.unmount(&source), Err(MountError::InsufficientPermissions));
        assert!(fx.ejector.ejected().is_empty());
        assert!(manager.find_mount_by_source(&source).unwrap().is_mounted());

        manager.unmount(&source).unwrap();
        assert_eq!(fx.ejector.ejected(), vec!["/dev/sr0".to_string()]);
    }

    #[test]
    fn test_unmount_all_suppresses_eject() {
        let fx = Fixture::new();
        let source = fx.add_disk("sr0", "iso9660", DeviceMediaType::OpticalDisc);
        let mut manager = fx.manager();
        manager.mount(&source, "", Vec::new(), None).unwrap();

        manager.unmount_all().unwrap();
        assert!(fx.ejector.ejected().is_empty());

        manager.mount(&source, "", Vec::new(), None).unwrap();
        fx.ejector.set_result(false);
        manager.unmount(&source).unwrap();
        assert_eq!(fx.ejector.ejected(), vec!["/dev/sr0".to_string()]);
    }

    #[test]
    fn test_suggest_mount_path() {
        let fx = Fixture::new();
        fx.disks.add_disk(Disk {
            device_path: "/sys/devices/usb/sdb1".to_string(),
            device_file: "/dev/sdb1".to_string(),
            label: "Photos/2024".to_string(),
            ..Disk::default()
        });
        let manager = fx.manager();
        let root = Path::new("/media/removable");
        assert_eq!(
            manager.backend().suggest_mount_path("/sys/devices/usb/sdb1", root),
            PathBuf::from("/media/removable/Photos_2024")
        );
        assert_eq!(
            manager.backend().suggest_mount_path("/dev/sdz9", root),
            PathBuf::from("/media/removable/sdz9")
        );
    }

    #[test]
    fn test_can_mount_prefixes() {
        let fx = Fixture::new();
        let manager = fx.manager();
        assert!(manager.can_mount("/sys/devices/usb/sdb1"));
        assert!(manager.can_mount("/devices/usb/sdb1"));
        assert!(manager.can_mount("/dev/sdb1"));
        assert!(!manager.can_mount("/home/chronos/a.zip"));
    }
}
