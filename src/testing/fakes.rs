/// In-memory collaborators for exercising managers and mounters without
/// touching the kernel
use crate::config::types::{MountError, MountResult};
use crate::device::{DeviceEjector, DeviceMediaType, Disk, DiskMonitor};
use crate::kernel::platform::Platform;
use crate::kernel::process::{SandboxedProcess, SandboxedProcessFactory};
use crate::mount::options::MountFlags;
use crate::observability::metrics::Metrics;
use nix::mount::MntFlags;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

/// Side-effecting platform call, in issue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Mount {
        source: String,
        target: PathBuf,
        filesystem_type: String,
        flags: MountFlags,
        data: String,
    },
    Unmount(PathBuf, MntFlags),
    CreateDirectory(PathBuf),
    RemoveDirectory(PathBuf),
    SetOwnership(PathBuf, u32, u32),
    SetPermissions(PathBuf, u32),
}

#[derive(Default)]
struct PlatformState {
    calls: Vec<PlatformCall>,
    mount_errors: VecDeque<MountError>,
    unmount_errors: VecDeque<MountError>,
    mounted: Vec<PathBuf>,
    directories: HashSet<PathBuf>,
    busy_directories: HashSet<PathBuf>,
    paths: HashSet<PathBuf>,
    namespace_paths: HashSet<PathBuf>,
    real_paths: HashMap<PathBuf, PathBuf>,
    users: HashMap<String, (u32, u32)>,
    groups: HashMap<String, u32>,
}

/// Platform that records calls and answers from configured state
pub struct FakePlatform {
    state: RefCell<PlatformState>,
    fuse_device_available: Cell<bool>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(PlatformState::default()),
            fuse_device_available: Cell::new(true),
        }
    }

    /// Users and groups named by `ManagerConfig::default()`
    pub fn with_default_users() -> Self {
        let platform = Self::new();
        platform.add_user("chronos", 1000, 1000);
        platform.add_group("chronos-access", 1001);
        platform.add_user("fuse-exfat", 300, 300);
        platform.add_user("ntfs-3g", 301, 301);
        platform.add_user("fuse-archivemount", 302, 302);
        platform
    }

    pub fn add_user(&self, name: &str, user_id: u32, group_id: u32) {
        self.state
            .borrow_mut()
            .users
            .insert(name.to_string(), (user_id, group_id));
    }

    pub fn add_group(&self, name: &str, group_id: u32) {
        self.state.borrow_mut().groups.insert(name.to_string(), group_id);
    }

    pub fn add_path(&self, path: &Path) {
        self.state.borrow_mut().paths.insert(path.to_path_buf());
    }

    pub fn add_directory(&self, path: &Path) {
        self.state.borrow_mut().directories.insert(path.to_path_buf());
    }

    /// Existing non-empty directory: cannot be reused or removed
    pub fn add_busy_directory(&self, path: &Path) {
        self.state
            .borrow_mut()
            .busy_directories
            .insert(path.to_path_buf());
    }

    /// Path visible only inside the configured mount namespace
    pub fn add_namespace_path(&self, path: &Path) {
        self.state
            .borrow_mut()
            .namespace_paths
            .insert(path.to_path_buf());
    }

    pub fn set_real_path(&self, path: &Path, real_path: &Path) {
        self.state
            .borrow_mut()
            .real_paths
            .insert(path.to_path_buf(), real_path.to_path_buf());
    }

    /// Mount left over from a previous run
    pub fn add_existing_mount(&self, path: &Path) {
        self.state.borrow_mut().mounted.push(path.to_path_buf());
    }

    pub fn push_mount_error(&self, error: MountError) {
        self.state.borrow_mut().mount_errors.push_back(error);
    }

    pub fn push_unmount_error(&self, error: MountError) {
        self.state.borrow_mut().unmount_errors.push_back(error);
    }

    pub fn set_fuse_device_available(&self, available: bool) {
        self.fuse_device_available.set(available);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.borrow().calls.clone()
    }

    pub fn mount_calls(&self) -> Vec<(String, PathBuf, String, MountFlags, String)> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Mount {
                    source,
                    target,
                    filesystem_type,
                    flags,
                    data,
                } => Some((
                    source.clone(),
                    target.clone(),
                    filesystem_type.clone(),
                    *flags,
                    data.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    pub fn unmount_calls(&self) -> Vec<(PathBuf, MntFlags)> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Unmount(path, flags) => Some((path.clone(), *flags)),
                _ => None,
            })
            .collect()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.state.borrow().mounted.clone()
    }

    pub fn has_directory(&self, path: &Path) -> bool {
        self.state.borrow().directories.contains(path)
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    fn record(&self, call: PlatformCall) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for FakePlatform {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        filesystem_type: &str,
        flags: MountFlags,
        data: &str,
    ) -> MountResult<()> {
        self.record(PlatformCall::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            filesystem_type: filesystem_type.to_string(),
            flags,
            data: data.to_string(),
        });
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.mount_errors.pop_front() {
            return Err(error);
        }
        if flags & libc::MS_REMOUNT == 0 {
            state.mounted.push(target.to_path_buf());
        }
        Ok(())
    }

    fn unmount(&self, path: &Path, flags: MntFlags) -> MountResult<()> {
        self.record(PlatformCall::Unmount(path.to_path_buf(), flags));
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.unmount_errors.pop_front() {
            return Err(error);
        }
        state.mounted.retain(|p| p != path);
        Ok(())
    }

    fn create_directory(&self, path: &Path) -> MountResult<()> {
        self.record(PlatformCall::CreateDirectory(path.to_path_buf()));
        let mut state = self.state.borrow_mut();
        if state.directories.contains(path) || state.busy_directories.contains(path) {
            return Err(MountError::DirectoryCreationFailed);
        }
        state.directories.insert(path.to_path_buf());
        Ok(())
    }

    fn create_or_reuse_empty_directory(&self, path: &Path) -> MountResult<()> {
        self.record(PlatformCall::CreateDirectory(path.to_path_buf()));
        let mut state = self.state.borrow_mut();
        if state.busy_directories.contains(path) {
            return Err(MountError::DirectoryCreationFailed);
        }
        state.directories.insert(path.to_path_buf());
        Ok(())
    }

    fn remove_empty_directory(&self, path: &Path) -> MountResult<()> {
        self.record(PlatformCall::RemoveDirectory(path.to_path_buf()));
        let mut state = self.state.borrow_mut();
        if state.busy_directories.contains(path) {
            return Err(MountError::Internal);
        }
        if state.directories.remove(path) {
            Ok(())
        } else {
            Err(MountError::InvalidPath)
        }
    }

    fn set_ownership(&self, path: &Path, user_id: u32, group_id: u32) -> MountResult<()> {
        self.record(PlatformCall::SetOwnership(path.to_path_buf(), user_id, group_id));
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> MountResult<()> {
        self.record(PlatformCall::SetPermissions(path.to_path_buf(), mode));
        Ok(())
    }

    fn get_user_and_group_id(&self, user_name: &str) -> Option<(u32, u32)> {
        self.state.borrow().users.get(user_name).copied()
    }

    fn get_group_id(&self, group_name: &str) -> Option<u32> {
        self.state.borrow().groups.get(group_name).copied()
    }

    fn path_exists(&self, path: &Path) -> bool {
        let state = self.state.borrow();
        state.paths.contains(path)
            || state.directories.contains(path)
            || state.busy_directories.contains(path)
    }

    fn directory_exists(&self, path: &Path) -> bool {
        let state = self.state.borrow();
        state.directories.contains(path) || state.busy_directories.contains(path)
    }

    fn get_real_path(&self, path: &Path) -> Option<PathBuf> {
        let real = self.state.borrow().real_paths.get(path).cloned();
        match real {
            Some(real) => Some(real),
            None if self.path_exists(path) => Some(path.to_path_buf()),
            None => None,
        }
    }

    fn list_directory(&self, path: &Path) -> Vec<PathBuf> {
        let state = self.state.borrow();
        let mut children: Vec<PathBuf> = state
            .directories
            .iter()
            .chain(state.busy_directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        children.sort();
        children
    }

    fn mounted_paths_under(&self, root: &Path) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .state
            .borrow()
            .mounted
            .iter()
            .filter(|p| p.as_path() != root && p.starts_with(root))
            .cloned()
            .collect();
        paths.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
        paths
    }

    fn open_fuse_device(&self) -> MountResult<File> {
        if !self.fuse_device_available.get() {
            return Err(MountError::Internal);
        }
        File::open("/dev/null").map_err(|_| MountError::Internal)
    }

    fn path_exists_in_mount_namespace(&self, _namespace: &Path, path: &Path) -> bool {
        self.state.borrow().namespace_paths.contains(path)
    }
}

/// Everything a `FakeProcess` was asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeProcessState {
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub stdin: Option<String>,
    pub user_id: Option<u32>,
    pub group_id: Option<u32>,
    pub supplementary_groups: Vec<u32>,
    pub seccomp_policy: Option<PathBuf>,
    pub network_access: bool,
    pub new_mount_namespace: bool,
    pub existing_namespace: Option<PathBuf>,
    /// (source, target, writable, recursive)
    pub bind_mounts: Vec<(PathBuf, PathBuf, bool, bool)>,
    pub preserved_fds: Vec<RawFd>,
    pub pid: Option<i32>,
    pub started: bool,
}

/// `SandboxedProcess` whose state is shared with the test
pub struct FakeProcess {
    state: Rc<RefCell<FakeProcessState>>,
    pid_on_start: i32,
    start_error: Option<MountError>,
}

impl FakeProcess {
    pub fn new(executable: &Path, pid_on_start: i32) -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeProcessState {
                executable: executable.to_path_buf(),
                network_access: true,
                ..FakeProcessState::default()
            })),
            pid_on_start,
            start_error: None,
        }
    }

    /// Already-running process with a known pid
    pub fn with_pid(pid: i32) -> Self {
        let process = Self::new(Path::new("/bin/fake"), pid);
        {
            let mut state = process.state.borrow_mut();
            state.pid = Some(pid);
            state.started = true;
        }
        process
    }

    pub fn state(&self) -> Rc<RefCell<FakeProcessState>> {
        self.state.clone()
    }
}

impl SandboxedProcess for FakeProcess {
    fn bind_mount(
        &mut self,
        source: &Path,
        target: &Path,
        writable: bool,
        recursive: bool,
    ) -> MountResult<()> {
        self.state.borrow_mut().bind_mounts.push((
            source.to_path_buf(),
            target.to_path_buf(),
            writable,
            recursive,
        ));
        Ok(())
    }

    fn add_argument(&mut self, argument: &str) {
        self.state.borrow_mut().arguments.push(argument.to_string());
    }

    fn set_stdin(&mut self, input: &str) {
        self.state.borrow_mut().stdin = Some(input.to_string());
    }

    fn set_user_id(&mut self, user_id: u32) {
        self.state.borrow_mut().user_id = Some(user_id);
    }

    fn set_group_id(&mut self, group_id: u32) {
        self.state.borrow_mut().group_id = Some(group_id);
    }

    fn set_supplementary_groups(&mut self, group_ids: &[u32]) {
        self.state.borrow_mut().supplementary_groups = group_ids.to_vec();
    }

    fn set_seccomp_policy(&mut self, policy: &Path) {
        self.state.borrow_mut().seccomp_policy = Some(policy.to_path_buf());
    }

    fn set_network_access(&mut self, enabled: bool) {
        self.state.borrow_mut().network_access = enabled;
    }

    fn new_mount_namespace(&mut self) {
        self.state.borrow_mut().new_mount_namespace = true;
    }

    fn enter_existing_mount_namespace(&mut self, namespace: &Path) -> bool {
        self.state.borrow_mut().existing_namespace = Some(namespace.to_path_buf());
        true
    }

    fn preserve_file(&mut self, file: File) {
        self.state.borrow_mut().preserved_fds.push(file.as_raw_fd());
    }

    fn start(&mut self) -> MountResult<i32> {
        if let Some(error) = self.start_error {
            return Err(error);
        }
        let mut state = self.state.borrow_mut();
        state.started = true;
        state.pid = Some(self.pid_on_start);
        Ok(self.pid_on_start)
    }

    fn pid(&self) -> Option<i32> {
        self.state.borrow().pid
    }
}

/// Factory handing out `FakeProcess`es with increasing pids
pub struct FakeProcessFactory {
    created: RefCell<Vec<Rc<RefCell<FakeProcessState>>>>,
    next_pid: Cell<i32>,
    start_error: Cell<Option<MountError>>,
}

impl FakeProcessFactory {
    pub fn new() -> Self {
        Self {
            created: RefCell::new(Vec::new()),
            next_pid: Cell::new(100),
            start_error: Cell::new(None),
        }
    }

    /// Make the next created process fail to start
    pub fn fail_next_start(&self, error: MountError) {
        self.start_error.set(Some(error));
    }

    pub fn created(&self) -> Vec<FakeProcessState> {
        self.created
            .borrow()
            .iter()
            .map(|state| state.borrow().clone())
            .collect()
    }

    pub fn last(&self) -> Option<FakeProcessState> {
        self.created.borrow().last().map(|state| state.borrow().clone())
    }
}

impl Default for FakeProcessFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxedProcessFactory for FakeProcessFactory {
    fn create_sandboxed_process(&self, executable: &Path) -> Box<dyn SandboxedProcess> {
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        let mut process = FakeProcess::new(executable, pid);
        process.start_error = self.start_error.take();
        self.created.borrow_mut().push(process.state());
        Box::new(process)
    }
}

/// Disk monitor answering from registered snapshots
#[derive(Default)]
pub struct FakeDiskMonitor {
    disks: RefCell<Vec<Disk>>,
}

impl FakeDiskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_disk(&self, disk: Disk) {
        self.disks.borrow_mut().push(disk);
    }
}

impl DiskMonitor for FakeDiskMonitor {
    fn get_disk_by_device_path(&self, device_path: &Path) -> Option<Disk> {
        let wanted = device_path.to_string_lossy();
        self.disks
            .borrow()
            .iter()
            .find(|disk| disk.device_path == wanted || (!disk.device_file.is_empty() && disk.device_file == wanted))
            .cloned()
    }
}

/// Ejector that records requests
pub struct FakeEjector {
    ejected: RefCell<Vec<String>>,
    result: Cell<bool>,
}

impl FakeEjector {
    pub fn new() -> Self {
        Self {
            ejected: RefCell::new(Vec::new()),
            result: Cell::new(true),
        }
    }

    pub fn set_result(&self, result: bool) {
        self.result.set(result);
    }

    pub fn ejected(&self) -> Vec<String> {
        self.ejected.borrow().clone()
    }
}

impl Default for FakeEjector {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceEjector for FakeEjector {
    fn eject(&self, device_file: &str) -> bool {
        self.ejected.borrow_mut().push(device_file.to_string());
        self.result.get()
    }
}

/// Metrics sink keeping every observation in order
#[derive(Default)]
pub struct RecordingMetrics {
    filesystem_types: RefCell<Vec<String>>,
    media_types: RefCell<Vec<DeviceMediaType>>,
    read_only_fallbacks: RefCell<Vec<String>>,
    daemon_exit_codes: RefCell<Vec<(String, i32)>>,
    archive_types: RefCell<Vec<String>>,
    mount_results: RefCell<Vec<(String, Option<MountError>)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filesystem_types(&self) -> Vec<String> {
        self.filesystem_types.borrow().clone()
    }

    pub fn media_types(&self) -> Vec<DeviceMediaType> {
        self.media_types.borrow().clone()
    }

    pub fn read_only_fallbacks(&self) -> Vec<String> {
        self.read_only_fallbacks.borrow().clone()
    }

    pub fn daemon_exit_codes(&self) -> Vec<(String, i32)> {
        self.daemon_exit_codes.borrow().clone()
    }

    pub fn archive_types(&self) -> Vec<String> {
        self.archive_types.borrow().clone()
    }

    pub fn mount_results(&self) -> Vec<(String, Option<MountError>)> {
        self.mount_results.borrow().clone()
    }
}

impl Metrics for RecordingMetrics {
    fn record_filesystem_type(&self, filesystem_type: &str) {
        self.filesystem_types
            .borrow_mut()
            .push(filesystem_type.to_string());
    }

    fn record_device_media_type(&self, media_type: DeviceMediaType) {
        self.media_types.borrow_mut().push(media_type);
    }

    fn record_read_only_fallback(&self, filesystem_type: &str) {
        self.read_only_fallbacks
            .borrow_mut()
            .push(filesystem_type.to_string());
    }

    fn record_daemon_exit_code(&self, daemon: &str, exit_code: i32) {
        self.daemon_exit_codes
            .borrow_mut()
            .push((daemon.to_string(), exit_code));
    }

    fn record_archive_type(&self, archive_type: &str) {
        self.archive_types.borrow_mut().push(archive_type.to_string());
    }

    fn record_mount_duration(&self, filesystem_type: &str, _duration: Duration, error: Option<MountError>) {
        self.mount_results
            .borrow_mut()
            .push((filesystem_type.to_string(), error));
    }
}
