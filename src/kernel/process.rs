/// Sandboxed filesystem daemon processes
///
/// `CommandProcess` spawns the daemon through `std::process::Command`. The
/// confinement chain runs in `pre_exec`:
/// preserved fds -> setns -> unshare(NEWNS) + private `/` -> bind mounts ->
/// unshare(NEWNET) -> capability drop -> credentials -> no_new_privs
///
/// Exits are reported asynchronously as `Event::LauncherExit` by a waiter
/// thread per child.
use crate::config::types::{MountError, MountResult};
use crate::dispatch::{Event, EventSender};
use crate::kernel::namespace::{self, PreparedBindMount};
use crate::kernel::{capabilities, credentials};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A daemon launched inside a sandbox
pub trait SandboxedProcess {
    /// Bind `source` onto `target` inside the daemon's mount namespace
    fn bind_mount(&mut self, source: &Path, target: &Path, writable: bool, recursive: bool)
        -> MountResult<()>;

    fn add_argument(&mut self, argument: &str);

    /// Data written to the daemon's stdin after start
    fn set_stdin(&mut self, input: &str);

    fn set_user_id(&mut self, user_id: u32);

    fn set_group_id(&mut self, group_id: u32);

    fn set_supplementary_groups(&mut self, group_ids: &[u32]);

    fn set_seccomp_policy(&mut self, policy: &Path);

    fn set_network_access(&mut self, enabled: bool);

    fn new_mount_namespace(&mut self);

    /// Returns false when the namespace cannot be opened
    fn enter_existing_mount_namespace(&mut self, namespace: &Path) -> bool;

    /// Keep `file` open across exec at the same descriptor number
    fn preserve_file(&mut self, file: File);

    /// Launch the daemon; returns its pid
    fn start(&mut self) -> MountResult<i32>;

    fn pid(&self) -> Option<i32>;
}

/// Creates daemon processes for a given executable
pub trait SandboxedProcessFactory {
    fn create_sandboxed_process(&self, executable: &Path) -> Box<dyn SandboxedProcess>;
}

/// `SandboxedProcess` backed by a real child process
pub struct CommandProcess {
    executable: PathBuf,
    arguments: Vec<String>,
    stdin: Option<String>,
    user_id: Option<u32>,
    group_id: Option<u32>,
    supplementary_groups: Vec<u32>,
    seccomp_policy: Option<PathBuf>,
    network_access: bool,
    new_mount_namespace: bool,
    existing_namespace: Option<File>,
    bind_mounts: Vec<PreparedBindMount>,
    preserved_files: Vec<File>,
    pid: Option<i32>,
    events: EventSender,
}

impl CommandProcess {
    pub fn new(executable: &Path, events: EventSender) -> Self {
        Self {
            executable: executable.to_path_buf(),
            arguments: Vec::new(),
            stdin: None,
            user_id: None,
            group_id: None,
            supplementary_groups: Vec::new(),
            seccomp_policy: None,
            network_access: true,
            new_mount_namespace: false,
            existing_namespace: None,
            bind_mounts: Vec::new(),
            preserved_files: Vec::new(),
            pid: None,
            events,
        }
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

fn path_to_cstring(path: &Path) -> MountResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| MountError::InvalidPath)
}

fn child_keep_fd_across_exec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd owned by the parent's File.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// 128 + signal for signal deaths, matching shell conventions
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

impl SandboxedProcess for CommandProcess {
    fn bind_mount(
        &mut self,
        source: &Path,
        target: &Path,
        writable: bool,
        recursive: bool,
    ) -> MountResult<()> {
        self.bind_mounts.push(PreparedBindMount {
            source: path_to_cstring(source)?,
            target: path_to_cstring(target)?,
            writable,
            recursive,
        });
        Ok(())
    }

    fn add_argument(&mut self, argument: &str) {
        self.arguments.push(argument.to_string());
    }

    fn set_stdin(&mut self, input: &str) {
        self.stdin = Some(input.to_string());
    }

    fn set_user_id(&mut self, user_id: u32) {
        self.user_id = Some(user_id);
    }

    fn set_group_id(&mut self, group_id: u32) {
        self.group_id = Some(group_id);
    }

    fn set_supplementary_groups(&mut self, group_ids: &[u32]) {
        self.supplementary_groups = group_ids.to_vec();
    }

    fn set_seccomp_policy(&mut self, policy: &Path) {
        self.seccomp_policy = Some(policy.to_path_buf());
    }

    fn set_network_access(&mut self, enabled: bool) {
        self.network_access = enabled;
    }

    fn new_mount_namespace(&mut self) {
        self.new_mount_namespace = true;
    }

    fn enter_existing_mount_namespace(&mut self, namespace: &Path) -> bool {
        match File::open(namespace) {
            Ok(file) => {
                self.existing_namespace = Some(file);
                true
            }
            Err(e) => {
                log::warn!(
                    "Cannot open mount namespace {}: {}",
                    namespace.display(),
                    e
                );
                false
            }
        }
    }

    fn preserve_file(&mut self, file: File) {
        self.preserved_files.push(file);
    }

    fn start(&mut self) -> MountResult<i32> {
        if self.pid.is_some() {
            log::error!("{} already started", self.executable.display());
            return Err(MountError::Internal);
        }

        let (Some(uid), Some(gid)) = (self.user_id, self.group_id) else {
            log::error!("No run-as identity for {}", self.executable.display());
            return Err(MountError::Internal);
        };
        credentials::validate_ids(uid, gid)?;

        if let Some(policy) = &self.seccomp_policy {
            // No filter loader is bundled; refuse rather than run unfiltered.
            log::error!(
                "Seccomp policy {} requested for {} but filters are not supported",
                policy.display(),
                self.executable.display()
            );
            return Err(MountError::Internal);
        }

        if !self.bind_mounts.is_empty() && !self.new_mount_namespace {
            log::error!(
                "Bind mounts for {} require a private mount namespace",
                self.executable.display()
            );
            return Err(MountError::Internal);
        }

        let preserved_fds: Vec<RawFd> = self.preserved_files.iter().map(|f| f.as_raw_fd()).collect();
        let namespace_fd = self.existing_namespace.as_ref().map(|f| f.as_raw_fd());
        let new_mount_namespace = self.new_mount_namespace;
        let bind_mounts = self.bind_mounts.clone();
        let network_access = self.network_access;
        let groups: Vec<libc::gid_t> = self.supplementary_groups.clone();

        let mut command = Command::new(&self.executable);
        command
            .args(&self.arguments)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // SAFETY: the hook runs between fork and exec and only issues raw
        // syscalls on data moved into the closure.
        unsafe {
            command.pre_exec(move || {
                for fd in &preserved_fds {
                    child_keep_fd_across_exec(*fd)?;
                }
                if let Some(fd) = namespace_fd {
                    namespace::child_enter_mount_namespace(fd)?;
                }
                if new_mount_namespace {
                    namespace::child_new_private_mount_namespace()?;
                }
                for bind in &bind_mounts {
                    namespace::child_bind_mount(bind)?;
                }
                if !network_access {
                    namespace::child_new_network_namespace()?;
                }
                capabilities::child_drop_bounding_set()?;
                capabilities::child_clear_ambient_capabilities();
                credentials::child_transition_to_unprivileged(uid, gid, &groups)?;
                capabilities::child_set_no_new_privs()?;
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| {
            log::error!("Cannot start {}: {}", self.executable.display(), e);
            MountError::MountProgramFailed
        })?;
        let pid = child.id() as i32;

        if let (Some(input), Some(mut pipe)) = (self.stdin.take(), child.stdin.take()) {
            if let Err(e) = pipe.write_all(input.as_bytes()) {
                log::warn!("Cannot write stdin of pid {}: {}", pid, e);
            }
        }

        // The child holds its own copies now.
        self.preserved_files.clear();
        self.existing_namespace = None;

        let events = self.events.clone();
        let executable = self.executable.clone();
        std::thread::spawn(move || {
            let exit_code = match child.wait() {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    log::error!("Cannot wait for {} (pid {}): {}", executable.display(), pid, e);
                    -1
                }
            };
            log::info!(
                "{} (pid {}) exited with code {}",
                executable.display(),
                pid,
                exit_code
            );
            let _ = events.send(Event::LauncherExit { pid, exit_code });
        });

        log::info!(
            "Started sandboxed {} as pid {} with args {:?}",
            self.executable.display(),
            pid,
            self.arguments
        );
        self.pid = Some(pid);
        Ok(pid)
    }

    fn pid(&self) -> Option<i32> {
        self.pid
    }
}

/// Produces `CommandProcess`es that report exits to one event queue
#[derive(Clone)]
pub struct CommandProcessFactory {
    events: EventSender,
}

impl CommandProcessFactory {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

impl SandboxedProcessFactory for CommandProcessFactory {
    fn create_sandboxed_process(&self, executable: &Path) -> Box<dyn SandboxedProcess> {
        Box::new(CommandProcess::new(executable, self.events.clone()))
    }
}
