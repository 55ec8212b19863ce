//! Archive files under the configured archive roots.

use crate::config::settings::ManagerConfig;
use crate::config::types::{MountError, MountResult, MountSourceType};
use crate::kernel::platform::Platform;
use crate::kernel::process::SandboxedProcessFactory;
use crate::mount::archive::{ArchiveMounter, ArchivePreparer};
use crate::mount::fuse::{FuseMounter, FuseMounterConfig, FuseSandboxFactory};
use crate::mount::manager::{MountBackend, MountManager};
use crate::mount::mounter::Mounter;
use crate::mount::point::MountPoint;
use crate::observability::metrics::Metrics;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

pub type ArchiveManager = MountManager<ArchiveBackend>;

pub struct ArchiveManagerDeps {
    pub platform: Rc<dyn Platform>,
    pub process_factory: Rc<dyn SandboxedProcessFactory>,
    pub metrics: Option<Rc<dyn Metrics>>,
}

pub struct ArchiveBackend {
    archive_roots: Vec<PathBuf>,
    mounters: Vec<ArchiveMounter>,
}

impl ArchiveBackend {
    pub fn new(archive_roots: Vec<PathBuf>) -> Self {
        Self {
            archive_roots,
            mounters: Vec::new(),
        }
    }

    pub fn add_mounter(&mut self, mounter: ArchiveMounter) {
        self.mounters.push(mounter);
    }

    pub fn mounter_count(&self) -> usize {
        self.mounters.len()
    }

    fn is_under_archive_root(&self, path: &Path) -> bool {
        if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            return false;
        }
        self.archive_roots
            .iter()
            .any(|root| path != root.as_path() && path.starts_with(root))
    }

    fn find_mounter(&self, source: &str) -> Option<&ArchiveMounter> {
        self.mounters
            .iter()
            .find(|mounter| mounter.can_mount(source, &[]).is_some())
    }
}

impl MountBackend for ArchiveBackend {
    fn name(&self) -> &str {
        "archive"
    }

    fn can_mount(&self, source: &str) -> bool {
        self.is_under_archive_root(Path::new(source)) && self.find_mounter(source).is_some()
    }

    fn suggest_mount_path(&self, source: &str, mount_root: &Path) -> PathBuf {
        let name = Path::new(source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        mount_root.join(name)
    }

    fn do_mount(
        &self,
        source: &str,
        _filesystem_type: &str,
        options: Vec<String>,
        mount_path: &Path,
    ) -> MountResult<MountPoint> {
        let Some(mounter) = self.find_mounter(source) else {
            log::error!("No archive mounter for {}", source);
            return Err(MountError::UnsupportedFilesystem);
        };
        let mut mount_point = mounter.mount(source, mount_path, options)?;
        mount_point.set_source_type(MountSourceType::Archive);
        Ok(mount_point)
    }
}

impl ArchiveManager {
    /// One `ArchiveMounter` per configured archive entry whose daemon user
    /// resolves
    pub fn from_config(config: &ManagerConfig, deps: ArchiveManagerDeps) -> Self {
        let platform = deps.platform.clone();
        let mut backend = ArchiveBackend::new(config.archive_roots.clone());

        let files_user_id = platform.get_user_and_group_id(&config.files_user).map(|(uid, _)| uid);
        let files_group_id = platform.get_group_id(&config.files_group);

        match (files_user_id, files_group_id) {
            (Some(uid), Some(gid)) => {
                for entry in &config.archives {
                    let Some(factory) = FuseSandboxFactory::new(
                        platform.clone(),
                        deps.process_factory.clone(),
                        &entry.executable,
                        &entry.daemon_user,
                    ) else {
                        continue;
                    };
                    let factory = factory.with_seccomp_policy(entry.seccomp_policy.clone());
                    let preparer = ArchivePreparer::new(
                        platform.clone(),
                        factory,
                        entry.extensions.clone(),
                        entry.format_raw,
                        uid,
                        gid,
                    )
                    .with_mount_namespace(config.archive_mount_namespace.clone())
                    .with_metrics(deps.metrics.clone());
                    backend.add_mounter(FuseMounter::new(
                        platform.clone(),
                        FuseMounterConfig {
                            filesystem_type: entry.filesystem_type.clone(),
                            read_only: true,
                            metrics: deps.metrics.clone(),
                            metrics_name: entry.filesystem_type.clone(),
                            password_needed_exit_codes: entry.password_exit_codes.clone(),
                        },
                        preparer,
                    ));
                }
            }
            _ => log::warn!(
                "Archive mounting disabled: files user {}:{} does not resolve",
                config.files_user,
                config.files_group
            ),
        }

        log::info!("{} archive mounters registered", backend.mounter_count());
        MountManager::new(
            backend,
            platform,
            &config.archive_mount_root,
            config.max_mount_path_suffix,
            deps.metrics,
        )
    }
}
