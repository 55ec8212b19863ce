//! Mount strategies and the direct kernel mounter.

use crate::config::types::{MountError, MountResult, MountSourceType};
use crate::kernel::platform::Platform;
use crate::mount::options::{is_read_only_mount, join_params_into_options, MountFlags, MS_NOSYMFOLLOW};
use crate::mount::point::{MountPoint, MountPointData};
use std::path::Path;
use std::rc::Rc;

/// Flags every removable-media mount carries
pub const BASELINE_MOUNT_FLAGS: MountFlags =
    libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_NOSUID | MS_NOSYMFOLLOW | libc::MS_DIRSYNC;

/// One mount technique
pub trait Mounter {
    /// Filesystem this mounter handles (registry name, not the mount(2) type)
    fn filesystem_type(&self) -> &str;

    /// Suggested directory name when `source` can be mounted
    fn can_mount(&self, source: &str, params: &[String]) -> Option<String>;

    fn mount(&self, source: &str, target_path: &Path, params: Vec<String>) -> MountResult<MountPoint>;
}

/// Hook turning caller parameters into extra mount data
pub trait ParamsParser {
    fn parse_params(&self, params: &[String], options: &mut Vec<String>) -> MountResult<()>;
}

/// Caller parameters only select read-only mode
#[derive(Debug, Clone, Copy, Default)]
pub struct NoParams;

impl ParamsParser for NoParams {
    fn parse_params(&self, _params: &[String], _options: &mut Vec<String>) -> MountResult<()> {
        Ok(())
    }
}

/// FAT stores local time; the kernel needs the current offset from UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct FatParams;

impl FatParams {
    pub fn time_offset_minutes() -> i32 {
        chrono::Local::now().offset().local_minus_utc() / 60
    }
}

impl ParamsParser for FatParams {
    fn parse_params(&self, _params: &[String], options: &mut Vec<String>) -> MountResult<()> {
        options.push(format!("time_offset={}", Self::time_offset_minutes()));
        Ok(())
    }
}

/// Direct mount(2) of a kernel filesystem
pub struct SystemMounter {
    platform: Rc<dyn Platform>,
    filesystem_type: String,
    kernel_filesystem: String,
    read_only: bool,
    options: Vec<String>,
    params_parser: Box<dyn ParamsParser>,
}

impl SystemMounter {
    pub fn new(
        platform: Rc<dyn Platform>,
        filesystem_type: &str,
        read_only: bool,
        options: Vec<String>,
    ) -> Self {
        Self {
            platform,
            filesystem_type: filesystem_type.to_string(),
            kernel_filesystem: filesystem_type.to_string(),
            read_only,
            options,
            params_parser: Box::new(NoParams),
        }
    }

    /// Type passed to mount(2) when it differs from the registry name
    pub fn with_kernel_filesystem(mut self, kernel_filesystem: &str) -> Self {
        self.kernel_filesystem = kernel_filesystem.to_string();
        self
    }

    pub fn with_params_parser(mut self, params_parser: Box<dyn ParamsParser>) -> Self {
        self.params_parser = params_parser;
        self
    }
}

impl Mounter for SystemMounter {
    fn filesystem_type(&self) -> &str {
        &self.filesystem_type
    }

    fn can_mount(&self, _source: &str, _params: &[String]) -> Option<String> {
        Some("disk".to_string())
    }

    fn mount(&self, source: &str, target_path: &Path, params: Vec<String>) -> MountResult<MountPoint> {
        let mut flags = BASELINE_MOUNT_FLAGS;
        if self.read_only || is_read_only_mount(&params) {
            flags |= libc::MS_RDONLY;
        }

        let mut options = self.options.clone();
        self.params_parser.parse_params(&params, &mut options)?;
        let data = join_params_into_options(&options).map_err(|e| {
            log::error!("Invalid options for {} mount of {}", self.filesystem_type, source);
            e
        })?;

        if source.is_empty() {
            return Err(MountError::InvalidArgument);
        }

        MountPoint::mount(
            MountPointData {
                mount_path: target_path.to_path_buf(),
                source: source.to_string(),
                source_type: MountSourceType::RemovableDevice,
                filesystem_type: self.kernel_filesystem.clone(),
                flags,
                data,
                error: None,
            },
            self.platform.clone(),
        )
    }
}
