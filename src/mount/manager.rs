//! Generic mount orchestration.
//!
//! `MountManager` owns the source → `MountPoint` cache and the reservation
//! map for one mount root. Mount technique is supplied by a `MountBackend`.
//! All methods run on the dispatch thread.

use crate::config::types::{MountError, MountResult, UnmountAllError, UnmountFailure};
use crate::dispatch::{Event, EventQueue};
use crate::kernel::platform::Platform;
use crate::mount::options::{
    get_param_value, has_exact_param, is_read_only_mount, remove_params_with_same_name,
    OPTION_REMOUNT,
};
use crate::mount::point::{MountPoint, MountPointData};
use crate::observability::audit::{MountAuditEvent, MountAuditKind};
use crate::observability::metrics::Metrics;
use crossbeam_channel::Sender;
use nix::mount::MntFlags;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

const MOUNT_LABEL_PARAM: &str = "mountlabel";
const MOUNT_ROOT_MODE: u32 = 0o755;

/// Technique-specific half of a manager
pub trait MountBackend {
    /// Short name for logs and metrics labels
    fn name(&self) -> &str;

    fn can_mount(&self, source: &str) -> bool;

    /// Directory to mount `source` at when the caller gives none
    fn suggest_mount_path(&self, source: &str, mount_root: &Path) -> PathBuf;

    fn do_mount(
        &self,
        source: &str,
        filesystem_type: &str,
        options: Vec<String>,
        mount_path: &Path,
    ) -> MountResult<MountPoint>;

    fn do_unmount(&self, mount_point: &mut MountPoint) -> MountResult<()> {
        mount_point.unmount()
    }

    fn do_remount(&self, mount_point: &mut MountPoint, options: &[String]) -> MountResult<()> {
        mount_point.remount(is_read_only_mount(options))
    }

    fn should_reserve_mount_path_on_error(&self, _error: MountError) -> bool {
        false
    }

    fn begin_unmount_all(&self) {}

    fn end_unmount_all(&self) {}
}

/// Result of a successful `mount`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOutcome {
    pub mount_path: PathBuf,
    pub read_only: bool,
    /// A daemon is still bringing the mount up; a `MountCompletion` follows
    pub in_progress: bool,
}

/// Final status of a mount that was in progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCompletion {
    pub source: String,
    pub mount_path: PathBuf,
    pub filesystem_type: String,
    pub error: Option<MountError>,
    pub read_only: bool,
}

fn trimmed(path: &Path) -> String {
    let text = path.to_string_lossy();
    text.trim_end_matches('/').to_string()
}

/// `path` sits directly inside `parent` and is not `parent` itself
pub fn is_path_immediate_child_of_parent(path: &Path, parent: &Path) -> bool {
    let path = trimmed(path);
    let parent = trimmed(parent);
    if path == parent {
        return false;
    }
    match path.rsplit_once('/') {
        Some((dir, base)) => dir == parent && !base.is_empty(),
        None => false,
    }
}

pub fn is_valid_mount_path(path: &Path, mount_root: &Path) -> bool {
    if !is_path_immediate_child_of_parent(path, mount_root) {
        return false;
    }
    let path = trimmed(path);
    !matches!(path.rsplit_once('/'), Some((_, ".")) | Some((_, "..")))
}

/// Remove every `mountlabel=` option, returning the last non-empty value
pub fn extract_mount_label_from_options(options: &mut Vec<String>) -> Option<String> {
    let label = get_param_value(options, MOUNT_LABEL_PARAM);
    remove_params_with_same_name(options, MOUNT_LABEL_PARAM);
    label.filter(|l| !l.is_empty())
}

pub struct MountManager<B: MountBackend> {
    backend: B,
    platform: Rc<dyn Platform>,
    mount_root: PathBuf,
    max_mount_path_suffix: u32,
    metrics: Option<Rc<dyn Metrics>>,
    mount_states: BTreeMap<String, MountPoint>,
    reserved_mount_paths: HashMap<PathBuf, MountError>,
    completions: Option<Sender<MountCompletion>>,
}

impl<B: MountBackend> MountManager<B> {
    pub fn new(
        backend: B,
        platform: Rc<dyn Platform>,
        mount_root: &Path,
        max_mount_path_suffix: u32,
        metrics: Option<Rc<dyn Metrics>>,
    ) -> Self {
        Self {
            backend,
            platform,
            mount_root: mount_root.to_path_buf(),
            max_mount_path_suffix,
            metrics,
            mount_states: BTreeMap::new(),
            reserved_mount_paths: HashMap::new(),
            completions: None,
        }
    }

    /// Deliver `MountCompletion`s for in-progress mounts to `sender`
    pub fn with_completion_sender(mut self, sender: Sender<MountCompletion>) -> Self {
        self.completions = Some(sender);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn can_mount(&self, source: &str) -> bool {
        self.backend.can_mount(source)
    }

    /// Create the mount root and clear what a previous run left behind
    pub fn initialize(&mut self) -> MountResult<()> {
        if !self.platform.directory_exists(&self.mount_root) {
            self.platform.create_directory(&self.mount_root).map_err(|e| {
                log::error!("Cannot create mount root {}: {}", self.mount_root.display(), e);
                e
            })?;
        }
        self.platform.set_permissions(&self.mount_root, MOUNT_ROOT_MODE)?;

        for stale in self.platform.mounted_paths_under(&self.mount_root) {
            match self
                .platform
                .unmount(&stale, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH)
            {
                Ok(()) => log::info!("Unmounted stale mount {}", stale.display()),
                Err(e) => log::warn!("Cannot unmount stale mount {}: {}", stale.display(), e),
            }
        }

        let removed = self.remove_stale_directories();
        log::info!(
            "{} manager ready at {} ({} stale directories removed)",
            self.backend.name(),
            self.mount_root.display(),
            removed
        );
        Ok(())
    }

    /// Remove empty directories under the root that no mount or reservation
    /// accounts for; returns how many were removed
    pub fn remove_stale_directories(&mut self) -> usize {
        let in_use: HashSet<PathBuf> = self
            .mount_states
            .values()
            .map(|mp| mp.path().to_path_buf())
            .chain(self.reserved_mount_paths.keys().cloned())
            .chain(self.platform.mounted_paths_under(&self.mount_root))
            .collect();

        let mut removed = 0;
        for entry in self.platform.list_directory(&self.mount_root) {
            if in_use.contains(&entry) || !self.platform.directory_exists(&entry) {
                continue;
            }
            match self.platform.remove_empty_directory(&entry) {
                Ok(()) => {
                    log::debug!("Removed stale directory {}", entry.display());
                    removed += 1;
                }
                Err(e) => log::debug!("Keeping {}: {}", entry.display(), e),
            }
        }

        if removed > 0 {
            MountAuditEvent::new(MountAuditKind::StaleCleanup, "")
                .with_mount_path(&self.mount_root)
                .emit();
        }
        removed
    }

    pub fn mount(
        &mut self,
        source: &str,
        filesystem_type: &str,
        options: Vec<String>,
        mount_path: Option<&Path>,
    ) -> MountResult<MountOutcome> {
        let started = Instant::now();
        let remount = has_exact_param(&options, OPTION_REMOUNT);
        let result = if source.is_empty() {
            log::error!("Refusing to mount an empty source");
            Err(MountError::InvalidArgument)
        } else if remount {
            self.remount(source, &options)
        } else {
            self.mount_new_source(source, filesystem_type, options, mount_path)
        };
        let elapsed = started.elapsed();

        let cached = self.mount_states.get(source);
        let metrics_type = cached
            .map(|mp| mp.filesystem_type().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| {
                if filesystem_type.is_empty() {
                    self.backend.name().to_string()
                } else {
                    filesystem_type.to_string()
                }
            });

        let status = match &result {
            Ok(outcome) if outcome.in_progress => Some(MountError::InProgress),
            Ok(_) => None,
            Err(e) => Some(*e),
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_mount_duration(&metrics_type, elapsed, status);
        }

        let mut audit = MountAuditEvent::new(
            if remount { MountAuditKind::Remount } else { MountAuditKind::Mount },
            source,
        )
        .with_filesystem_type(&metrics_type)
        .with_error(status)
        .with_duration(elapsed);
        if let Some(mp) = cached {
            audit = audit.with_mount_path(mp.path()).with_read_only(mp.is_read_only());
        }
        audit.emit();

        result
    }

    fn remount(&mut self, source: &str, options: &[String]) -> MountResult<MountOutcome> {
        let Some(mount_point) = self.mount_states.get_mut(source) else {
            log::error!("Cannot remount {}: not mounted", source);
            return Err(MountError::PathNotMounted);
        };
        self.backend.do_remount(mount_point, options)?;
        Ok(MountOutcome {
            mount_path: mount_point.path().to_path_buf(),
            read_only: mount_point.is_read_only(),
            in_progress: mount_point.is_in_progress(),
        })
    }

    fn mount_new_source(
        &mut self,
        source: &str,
        filesystem_type: &str,
        mut options: Vec<String>,
        mount_path: Option<&Path>,
    ) -> MountResult<MountOutcome> {
        let requested = mount_path.filter(|p| !p.as_os_str().is_empty());

        if let Some(existing) = self.mount_states.get(source) {
            if requested.map_or(true, |p| p == existing.path()) {
                if let Some(error) = existing.error().filter(|e| *e != MountError::InProgress) {
                    return Err(error);
                }
                log::info!("{} is already mounted at {}", source, existing.path().display());
                return Ok(MountOutcome {
                    mount_path: existing.path().to_path_buf(),
                    read_only: existing.is_read_only(),
                    in_progress: existing.is_in_progress(),
                });
            }
            log::error!(
                "{} is already mounted at {}, not {}",
                source,
                existing.path().display(),
                requested.map(|p| p.display().to_string()).unwrap_or_default()
            );
            return Err(MountError::PathAlreadyMounted);
        }

        let mount_label = extract_mount_label_from_options(&mut options);

        let target = match requested {
            Some(path) => self.prepare_requested_path(path)?,
            None => self.prepare_suggested_path(source, mount_label.as_deref())?,
        };

        match self.backend.do_mount(source, filesystem_type, options, &target) {
            Ok(mut mount_point) => {
                mount_point.set_must_remove_dir(true);
                self.reserved_mount_paths.remove(&target);
                let outcome = MountOutcome {
                    mount_path: target.clone(),
                    read_only: mount_point.is_read_only(),
                    in_progress: mount_point.is_in_progress(),
                };
                log::info!(
                    "Mounted {} at {}{}",
                    source,
                    target.display(),
                    if outcome.in_progress { " (in progress)" } else { "" }
                );
                if outcome.in_progress {
                    self.attach_completion(source, &mut mount_point);
                }
                self.mount_states.insert(source.to_string(), mount_point);
                Ok(outcome)
            }
            Err(error) if self.backend.should_reserve_mount_path_on_error(error) => {
                log::warn!(
                    "Cannot mount {} at {}: {}; reserving the path",
                    source,
                    target.display(),
                    error
                );
                self.reserved_mount_paths.entry(target.clone()).or_insert(error);
                let placeholder = MountPoint::create_unmounted(MountPointData {
                    mount_path: target,
                    source: source.to_string(),
                    filesystem_type: filesystem_type.to_string(),
                    error: Some(error),
                    ..MountPointData::default()
                });
                self.mount_states.insert(source.to_string(), placeholder);
                Err(error)
            }
            Err(error) => {
                log::error!("Cannot mount {} at {}: {}", source, target.display(), error);
                if let Err(e) = self.platform.remove_empty_directory(&target) {
                    log::warn!("Cannot remove {}: {}", target.display(), e);
                }
                Err(error)
            }
        }
    }

    /// Report the daemon's verdict on `mount_point` through the completion
    /// channel
    fn attach_completion(&self, source: &str, mount_point: &mut MountPoint) {
        let Some(sender) = self.completions.clone() else {
            return;
        };
        let source = source.to_string();
        let mount_path = mount_point.path().to_path_buf();
        let filesystem_type = mount_point.filesystem_type().to_string();
        let read_only = mount_point.is_read_only();
        mount_point.set_launcher_exit_callback(Box::new(move |error| {
            let completion = MountCompletion {
                source,
                mount_path,
                filesystem_type,
                error,
                read_only,
            };
            if let Err(e) = sender.send(completion) {
                log::debug!("Completion receiver for {} is gone", e.0.source);
            }
        }));
    }

    fn prepare_requested_path(&self, path: &Path) -> MountResult<PathBuf> {
        if let Some(error) = self.reserved_mount_paths.get(path) {
            log::warn!("{} is reserved by an earlier failure: {}", path.display(), error);
            return Err(*error);
        }
        if self.is_mount_path_in_cache(path) {
            log::error!("{} is already in use", path.display());
            return Err(MountError::PathAlreadyMounted);
        }
        if !is_valid_mount_path(path, &self.mount_root) {
            log::error!(
                "{} is not a valid mount path under {}",
                path.display(),
                self.mount_root.display()
            );
            return Err(MountError::InvalidPath);
        }
        self.platform
            .create_or_reuse_empty_directory(path)
            .map_err(|e| {
                log::error!("Cannot create mount directory {}: {}", path.display(), e);
                MountError::DirectoryCreationFailed
            })?;
        Ok(path.to_path_buf())
    }

    fn prepare_suggested_path(&self, source: &str, mount_label: Option<&str>) -> MountResult<PathBuf> {
        let mut suggested = self.backend.suggest_mount_path(source, &self.mount_root);
        if let Some(label) = mount_label {
            suggested = match suggested.parent() {
                Some(parent) => parent.join(label),
                None => self.mount_root.join(label),
            };
        }
        if !is_valid_mount_path(&suggested, &self.mount_root) {
            log::error!(
                "Suggested path {} for {} is not a valid mount path",
                suggested.display(),
                source
            );
            return Err(MountError::InvalidPath);
        }

        let taken: HashSet<PathBuf> = self
            .reserved_mount_paths
            .keys()
            .cloned()
            .chain(self.mount_states.values().map(|mp| mp.path().to_path_buf()))
            .collect();
        self.platform
            .create_or_reuse_empty_directory_with_fallback(
                &suggested,
                self.max_mount_path_suffix,
                &taken,
            )
            .map_err(|_| MountError::DirectoryCreationFailed)
    }

    fn find_source(&self, path_or_source: &str) -> Option<String> {
        if self.mount_states.contains_key(path_or_source) {
            return Some(path_or_source.to_string());
        }
        let path = Path::new(path_or_source);
        self.mount_states
            .iter()
            .find(|(_, mp)| mp.path() == path)
            .map(|(source, _)| source.clone())
    }

    /// Unmount by source or mount path
    pub fn unmount(&mut self, path_or_source: &str) -> MountResult<()> {
        let started = Instant::now();
        let Some(source) = self.find_source(path_or_source) else {
            log::warn!("{} is not mounted", path_or_source);
            return Err(MountError::PathNotMounted);
        };

        let result = match self.mount_states.get_mut(&source) {
            Some(mount_point) => {
                let result = Self::unmount_entry(&self.backend, self.platform.as_ref(), mount_point);
                MountAuditEvent::new(MountAuditKind::Unmount, &source)
                    .with_mount_path(mount_point.path())
                    .with_filesystem_type(mount_point.filesystem_type())
                    .with_error(result.err())
                    .with_duration(started.elapsed())
                    .emit();
                result
            }
            None => Err(MountError::PathNotMounted),
        };
        result?;

        if let Some(mount_point) = self.mount_states.remove(&source) {
            self.reserved_mount_paths.remove(mount_point.path());
            log::info!("Unmounted {} from {}", source, mount_point.path().display());
        }
        Ok(())
    }

    fn unmount_entry(backend: &B, platform: &dyn Platform, mount_point: &mut MountPoint) -> MountResult<()> {
        let placeholder = !mount_point.is_mounted();
        match backend.do_unmount(mount_point) {
            Ok(()) | Err(MountError::PathNotMounted) => {}
            Err(e) => return Err(e),
        }
        if placeholder {
            if let Err(e) = platform.remove_empty_directory(mount_point.path()) {
                log::debug!("Cannot remove {}: {}", mount_point.path().display(), e);
            }
        }
        Ok(())
    }

    /// Unmount every entry, placeholders included; the cache and the
    /// reservations are empty afterwards whatever fails
    pub fn unmount_all(&mut self) -> Result<(), UnmountAllError> {
        let started = Instant::now();
        self.backend.begin_unmount_all();

        let mut failures = Vec::new();
        let states = std::mem::take(&mut self.mount_states);
        for (source, mut mount_point) in states {
            if let Err(error) = Self::unmount_entry(&self.backend, self.platform.as_ref(), &mut mount_point) {
                log::error!(
                    "Cannot unmount {} from {}: {}",
                    source,
                    mount_point.path().display(),
                    error
                );
                failures.push(UnmountFailure {
                    mount_path: mount_point.path().to_path_buf(),
                    error,
                });
                mount_point.release();
            }
        }
        self.reserved_mount_paths.clear();

        self.backend.end_unmount_all();

        MountAuditEvent::new(MountAuditKind::UnmountAll, "")
            .with_mount_path(&self.mount_root)
            .with_error(failures.first().map(|f| f.error))
            .with_duration(started.elapsed())
            .emit();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(UnmountAllError { failures })
        }
    }

    /// Apply one event; false when it concerned nothing this manager owns
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::LauncherExit { pid, exit_code } => self.on_launcher_exit(pid, exit_code),
            Event::CleanupStaleDirectories => {
                self.remove_stale_directories();
                true
            }
        }
    }

    /// Drain and apply every queued event; returns how many were handled
    pub fn process_pending_events(&mut self, queue: &EventQueue) -> usize {
        let mut handled = 0;
        while let Some(event) = queue.try_next() {
            if self.handle_event(event) {
                handled += 1;
            }
        }
        handled
    }

    fn on_launcher_exit(&mut self, pid: i32, exit_code: i32) -> bool {
        let Some(source) = self
            .mount_states
            .iter()
            .find(|(_, mp)| mp.process_id() == Some(pid))
            .map(|(source, _)| source.clone())
        else {
            log::debug!("Ignoring exit of unknown daemon pid {}", pid);
            return false;
        };
        let Some(mount_point) = self.mount_states.get_mut(&source) else {
            return false;
        };

        let error = mount_point.on_launcher_exit(exit_code);

        MountAuditEvent::new(MountAuditKind::LauncherExit, &source)
            .with_mount_path(mount_point.path())
            .with_filesystem_type(mount_point.filesystem_type())
            .with_error(error)
            .with_launcher_exit(pid, exit_code)
            .emit();

        if error.is_some() {
            if let Err(e) = self.backend.do_unmount(mount_point) {
                log::warn!(
                    "Cannot unmount failed mount {}: {}",
                    mount_point.path().display(),
                    e
                );
            }
            self.mount_states.remove(&source);
        }
        true
    }

    pub fn is_mount_path_in_cache(&self, path: &Path) -> bool {
        self.mount_states.values().any(|mp| mp.path() == path)
    }

    pub fn is_mount_path_reserved(&self, path: &Path) -> bool {
        self.reserved_mount_paths.contains_key(path)
    }

    /// Snapshot of every cached entry, ordered by source
    pub fn mount_points(&self) -> Vec<MountPointData> {
        self.mount_states.values().map(|mp| mp.data().clone()).collect()
    }

    pub fn find_mount_by_source(&self, source: &str) -> Option<&MountPoint> {
        self.mount_states.get(source)
    }

    pub fn find_mount_by_mount_path(&self, path: &Path) -> Option<&MountPoint> {
        self.mount_states.values().find(|mp| mp.path() == path)
    }
}
