/// Manager configuration loaded from JSON
use crate::config::types::{MountboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Kernel driver gated on release channel and running kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDriverConfig {
    /// Detected filesystem name; registered as `kernel-<filesystem>`
    pub filesystem: String,
    /// Type passed to mount(2) (e.g. `ntfs3` for `ntfs`)
    pub kernel_filesystem: String,
    /// `major.minor`
    pub minimum_kernel: String,
    /// Release channels allowed to use the driver; empty allows all
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
    /// Append `uid=`/`gid=` of the files user
    #[serde(default = "default_true")]
    pub files_user_ids: bool,
}

/// FUSE daemon for block devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseDriverConfig {
    /// Detected filesystem name; registered as `fuse-<filesystem>`
    pub filesystem: String,
    pub executable: PathBuf,
    /// User the daemon runs as
    pub daemon_user: String,
    #[serde(default)]
    pub seccomp_policy: Option<PathBuf>,
    #[serde(default)]
    pub network_access: bool,
    /// Group names added to the daemon's supplementary groups
    #[serde(default)]
    pub supplementary_groups: Vec<String>,
    #[serde(default)]
    pub allowed_options: Vec<String>,
    #[serde(default)]
    pub allowed_option_prefixes: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// Filesystem mounted directly by the kernel; registered under its bare name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemFilesystemConfig {
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub options: Vec<String>,
    /// Append `uid=`/`gid=` of the files user
    #[serde(default)]
    pub files_user_ids: bool,
    /// Append `time_offset=` for FAT timestamps
    #[serde(default)]
    pub fat_time_offset: bool,
}

/// Archive daemon and the extensions it serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// FUSE subtype reported as `fuse.<filesystem_type>`
    pub filesystem_type: String,
    /// Lower-case extensions without the leading dot (`zip`, `tar.gz`)
    pub extensions: Vec<String>,
    pub executable: PathBuf,
    pub daemon_user: String,
    #[serde(default = "default_password_exit_codes")]
    pub password_exit_codes: Vec<i32>,
    /// Single-stream compressed files exposed as one raw file
    #[serde(default)]
    pub format_raw: bool,
    #[serde(default)]
    pub seccomp_policy: Option<PathBuf>,
}

/// Top-level configuration for the disk and archive managers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub mount_root: PathBuf,
    pub archive_mount_root: PathBuf,
    /// Directories whose files may be mounted as archives
    pub archive_roots: Vec<PathBuf>,
    pub max_mount_path_suffix: u32,
    pub release_channel: String,
    /// Owner of files exposed by mounts
    pub files_user: String,
    pub files_group: String,
    pub kernel_drivers: Vec<KernelDriverConfig>,
    pub fuse_drivers: Vec<FuseDriverConfig>,
    pub system_filesystems: Vec<SystemFilesystemConfig>,
    pub archives: Vec<ArchiveConfig>,
    /// Namespace where archives outside this one can still be found
    pub archive_mount_namespace: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_password_exit_codes() -> Vec<i32> {
    vec![36, 37]
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/media/removable"),
            archive_mount_root: PathBuf::from("/media/archive"),
            archive_roots: vec![
                PathBuf::from("/home/chronos"),
                PathBuf::from("/media/removable"),
            ],
            max_mount_path_suffix: 100,
            release_channel: "stable".to_string(),
            files_user: "chronos".to_string(),
            files_group: "chronos-access".to_string(),
            kernel_drivers: vec![
                KernelDriverConfig {
                    filesystem: "exfat".to_string(),
                    kernel_filesystem: "exfat".to_string(),
                    minimum_kernel: "5.15".to_string(),
                    channels: Vec::new(),
                    options: strings(&["iocharset=utf8", "dmask=0027", "fmask=0027"]),
                    files_user_ids: true,
                },
                KernelDriverConfig {
                    filesystem: "ntfs".to_string(),
                    kernel_filesystem: "ntfs3".to_string(),
                    minimum_kernel: "5.15".to_string(),
                    channels: strings(&["canary", "dev", "beta"]),
                    options: strings(&["iocharset=utf8", "dmask=0027", "fmask=0027"]),
                    files_user_ids: true,
                },
            ],
            fuse_drivers: vec![
                FuseDriverConfig {
                    filesystem: "exfat".to_string(),
                    executable: PathBuf::from("/usr/sbin/mount.exfat-fuse"),
                    daemon_user: "fuse-exfat".to_string(),
                    seccomp_policy: None,
                    network_access: false,
                    supplementary_groups: Vec::new(),
                    allowed_options: strings(&["dirsync"]),
                    allowed_option_prefixes: strings(&["umask=", "dmask=", "fmask="]),
                    read_only: false,
                },
                FuseDriverConfig {
                    filesystem: "ntfs".to_string(),
                    executable: PathBuf::from("/usr/bin/ntfs-3g"),
                    daemon_user: "ntfs-3g".to_string(),
                    seccomp_policy: None,
                    network_access: false,
                    supplementary_groups: Vec::new(),
                    allowed_options: strings(&["big_writes", "windows_names"]),
                    allowed_option_prefixes: strings(&["umask="]),
                    read_only: false,
                },
            ],
            system_filesystems: vec![
                SystemFilesystemConfig {
                    name: "vfat".to_string(),
                    read_only: false,
                    options: strings(&["flush", "shortname=mixed", "utf8"]),
                    files_user_ids: true,
                    fat_time_offset: true,
                },
                SystemFilesystemConfig {
                    name: "iso9660".to_string(),
                    read_only: true,
                    options: strings(&["utf8"]),
                    files_user_ids: true,
                    fat_time_offset: false,
                },
                SystemFilesystemConfig {
                    name: "udf".to_string(),
                    read_only: false,
                    options: strings(&["utf8"]),
                    files_user_ids: true,
                    fat_time_offset: false,
                },
                SystemFilesystemConfig {
                    name: "ext4".to_string(),
                    read_only: false,
                    options: Vec::new(),
                    files_user_ids: false,
                    fat_time_offset: false,
                },
            ],
            archives: vec![
                ArchiveConfig {
                    filesystem_type: "archive".to_string(),
                    extensions: strings(&[
                        "7z", "crx", "iso", "rar", "tar", "tar.bz2", "tar.gz", "tar.lz",
                        "tar.lzma", "tar.xz", "tar.z", "tar.zst", "taz", "tb2", "tbz", "tbz2",
                        "tgz", "tlz", "tlzma", "txz", "tz", "tzst", "zip",
                    ]),
                    executable: PathBuf::from("/usr/bin/fuse-archive"),
                    daemon_user: "fuse-archivemount".to_string(),
                    password_exit_codes: default_password_exit_codes(),
                    format_raw: false,
                    seccomp_policy: None,
                },
                ArchiveConfig {
                    filesystem_type: "archive".to_string(),
                    extensions: strings(&["bz", "bz2", "gz", "lz", "lzma", "xz", "z", "zst"]),
                    executable: PathBuf::from("/usr/bin/fuse-archive"),
                    daemon_user: "fuse-archivemount".to_string(),
                    password_exit_codes: default_password_exit_codes(),
                    format_raw: true,
                    seccomp_policy: None,
                },
            ],
            archive_mount_namespace: None,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MountboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_json(&content)?;
        log::info!("Loaded mount configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: ManagerConfig = serde_json::from_str(content)
            .map_err(|e| MountboxError::Config(format!("Failed to parse config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if !self.mount_root.is_absolute() {
            return Err(MountboxError::Config(format!(
                "mount_root must be absolute: {}",
                self.mount_root.display()
            )));
        }
        if !self.archive_mount_root.is_absolute() {
            return Err(MountboxError::Config(format!(
                "archive_mount_root must be absolute: {}",
                self.archive_mount_root.display()
            )));
        }
        for driver in &self.kernel_drivers {
            if crate::kernel::release::KernelVersion::parse(&driver.minimum_kernel).is_none() {
                return Err(MountboxError::Config(format!(
                    "Invalid minimum_kernel '{}' for kernel driver {}",
                    driver.minimum_kernel, driver.filesystem
                )));
            }
        }
        for archive in &self.archives {
            if archive.extensions.iter().any(|e| e.starts_with('.') || e.is_empty()) {
                return Err(MountboxError::Config(format!(
                    "Archive extensions for {} must be non-empty and have no leading dot",
                    archive.executable.display()
                )));
            }
        }
        Ok(())
    }
}
