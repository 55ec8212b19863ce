//! Archive files mounted read-only through a FUSE daemon.

use crate::config::types::{MountError, MountResult};
use crate::kernel::platform::Platform;
use crate::kernel::process::SandboxedProcess;
use crate::mount::fuse::{FuseMounter, FuseSandboxFactory, SandboxPreparer};
use crate::mount::options::get_param_value;
use crate::observability::metrics::Metrics;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

/// `FuseMounter` specialised for archives
pub type ArchiveMounter = FuseMounter<ArchivePreparer>;

pub struct ArchivePreparer {
    platform: Rc<dyn Platform>,
    sandbox_factory: FuseSandboxFactory,
    extensions: Vec<String>,
    format_raw: bool,
    files_user_id: u32,
    files_group_id: u32,
    mount_namespace: Option<PathBuf>,
    metrics: Option<Rc<dyn Metrics>>,
}

impl ArchivePreparer {
    pub fn new(
        platform: Rc<dyn Platform>,
        sandbox_factory: FuseSandboxFactory,
        extensions: Vec<String>,
        format_raw: bool,
        files_user_id: u32,
        files_group_id: u32,
    ) -> Self {
        Self {
            platform,
            sandbox_factory,
            extensions: extensions.into_iter().map(|e| e.to_ascii_lowercase()).collect(),
            format_raw,
            files_user_id,
            files_group_id,
            mount_namespace: None,
            metrics: None,
        }
    }

    /// Namespace searched when the archive is not visible in ours
    pub fn with_mount_namespace(mut self, namespace: Option<PathBuf>) -> Self {
        self.mount_namespace = namespace;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Rc<dyn Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registered extension `name` ends with, longest first
    pub fn matching_extension(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        let file_name = Path::new(&lower)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())?;

        // A compressed tarball is never a raw single-stream file.
        if self.format_raw && Self::stem_ends_with_tar(&file_name) {
            return None;
        }

        self.extensions
            .iter()
            .filter(|ext| {
                file_name.len() > ext.len() + 1
                    && file_name.ends_with(ext.as_str())
                    && file_name.as_bytes()[file_name.len() - ext.len() - 1] == b'.'
            })
            .max_by_key(|ext| ext.len())
            .map(|ext| ext.as_str())
    }

    fn stem_ends_with_tar(file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((stem, _)) => stem.ends_with(".tar"),
            None => false,
        }
    }

    fn validate_path(source: &str) -> MountResult<&Path> {
        let path = Path::new(source);
        if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            log::error!("Archive path {:?} must be absolute and canonical", source);
            return Err(MountError::InvalidPath);
        }
        Ok(path)
    }

    /// Other volumes of a multipart RAR set that live next to `archive`
    fn multipart_siblings(&self, archive: &Path) -> Vec<PathBuf> {
        let (Some(parent), Some(name)) = (archive.parent(), archive.file_name()) else {
            return Vec::new();
        };
        let name = name.to_string_lossy().into_owned();

        let mut siblings: Vec<PathBuf> = self
            .platform
            .list_directory(parent)
            .into_iter()
            .filter(|candidate| candidate.as_path() != archive)
            .filter(|candidate| {
                candidate
                    .file_name()
                    .map(|c| is_multipart_sibling(&name, &c.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();
        siblings.sort();
        siblings
    }
}

/// `archive.partNN.rar` pairs with other `archive.partMM.rar`; `archive.rar`
/// pairs with `archive.rNN`
pub fn is_multipart_sibling(archive_name: &str, candidate: &str) -> bool {
    let lower = archive_name.to_ascii_lowercase();
    let candidate_lower = candidate.to_ascii_lowercase();

    let Some(stem) = lower.strip_suffix(".rar") else {
        return false;
    };

    if let Some((base, part)) = stem.rsplit_once(".part") {
        if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
            return candidate_lower
                .strip_prefix(&format!("{}.part", base))
                .and_then(|rest| rest.strip_suffix(".rar"))
                .map(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                .unwrap_or(false);
        }
    }

    candidate_lower
        .strip_prefix(&format!("{}.r", stem))
        .map(|digits| digits.len() == 2 && digits.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

impl SandboxPreparer for ArchivePreparer {
    fn sandbox_factory(&self) -> &FuseSandboxFactory {
        &self.sandbox_factory
    }

    fn can_mount(&self, source: &str, _params: &[String]) -> Option<String> {
        let path = Path::new(source);
        if !path.is_absolute() {
            return None;
        }
        self.matching_extension(source)?;
        path.file_name().map(|name| name.to_string_lossy().into_owned())
    }

    fn prepare_sandbox(
        &self,
        source: &str,
        _target_path: &Path,
        params: Vec<String>,
    ) -> MountResult<Box<dyn SandboxedProcess>> {
        let archive = Self::validate_path(source)?;
        let Some(extension) = self.matching_extension(source) else {
            return Err(MountError::UnsupportedFilesystem);
        };

        let mut process = self.sandbox_factory.create_sandboxed_process()?;

        if !self.platform.path_exists(archive) {
            let in_namespace = self
                .mount_namespace
                .as_ref()
                .filter(|ns| self.platform.path_exists_in_mount_namespace(ns, archive));
            match in_namespace {
                Some(namespace) => {
                    if !process.enter_existing_mount_namespace(namespace) {
                        return Err(MountError::Internal);
                    }
                    log::info!(
                        "Archive {} resolved in mount namespace {}",
                        archive.display(),
                        namespace.display()
                    );
                }
                None => {
                    log::error!("Archive {} does not exist", archive.display());
                    return Err(MountError::InvalidPath);
                }
            }
        }

        process.bind_mount(archive, archive, false, false)?;
        if extension == "rar" {
            for sibling in self.multipart_siblings(archive) {
                process.bind_mount(&sibling, &sibling, false, false)?;
            }
        }

        let mut options = format!(
            "ro,umask=0222,uid={},gid={}",
            self.files_user_id, self.files_group_id
        );
        if self.format_raw {
            options.push_str(",formatraw");
        }
        process.add_argument("-o");
        process.add_argument(&options);
        process.add_argument(source);

        if let Some(password) = get_param_value(&params, "password") {
            process.set_stdin(&password);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_archive_type(extension);
        }
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::fuse::FuseMounterConfig;
    use crate::mount::mounter::Mounter;
    use crate::testing::fakes::{FakePlatform, FakeProcessFactory, RecordingMetrics};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct Fixture {
        platform: Rc<FakePlatform>,
        processes: Rc<FakeProcessFactory>,
        metrics: Rc<RecordingMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            let platform = Rc::new(FakePlatform::with_default_users());
            platform.add_path(Path::new("/usr/bin/fuse-archive"));
            Self {
                platform,
                processes: Rc::new(FakeProcessFactory::new()),
                metrics: Rc::new(RecordingMetrics::new()),
            }
        }

        fn mounter(&self, extensions: &[&str], format_raw: bool) -> ArchiveMounter {
            let factory = FuseSandboxFactory::new(
                self.platform.clone(),
                self.processes.clone(),
                Path::new("/usr/bin/fuse-archive"),
                "fuse-archivemount",
            )
            .unwrap();
            let preparer = ArchivePreparer::new(
                self.platform.clone(),
                factory,
                strings(extensions),
                format_raw,
                1000,
                1001,
            )
            .with_mount_namespace(Some(PathBuf::from("/run/namespaces/mnt_chrome")))
            .with_metrics(Some(self.metrics.clone() as Rc<dyn Metrics>));
            FuseMounter::new(
                self.platform.clone(),
                FuseMounterConfig {
                    filesystem_type: "archive".to_string(),
                    read_only: true,
                    metrics: Some(self.metrics.clone() as Rc<dyn Metrics>),
                    metrics_name: "archive".to_string(),
                    password_needed_exit_codes: vec![36, 37],
                },
                preparer,
            )
        }
    }

    #[test]
    fn test_extension_matching() {
        let fx = Fixture::new();
        let mounter = fx.mounter(&["zip", "tar", "tar.gz", "rar"], false);
        assert_eq!(
            mounter.can_mount("/home/chronos/u/Photos.ZIP", &[]),
            Some("Photos.ZIP".to_string())
        );
        assert_eq!(mounter.preparer().matching_extension("/a/b.tar.gz"), Some("tar.gz"));
        assert_eq!(mounter.can_mount("relative/a.zip", &[]), None);
        assert_eq!(mounter.can_mount("/a/b.txt", &[]), None);
        assert_eq!(mounter.can_mount("/a/zip", &[]), None);
    }

    #[test]
    fn test_raw_formats_skip_tarballs() {
        let fx = Fixture::new();
        let mounter = fx.mounter(&["gz", "xz"], true);
        assert_eq!(mounter.preparer().matching_extension("/a/log.gz"), Some("gz"));
        assert_eq!(mounter.preparer().matching_extension("/a/src.tar.gz"), None);
        assert_eq!(mounter.preparer().matching_extension("/a/SRC.TAR.XZ"), None);
    }

    #[test]
    fn test_rejects_relative_and_parent_paths() {
        let fx = Fixture::new();
        let mounter = fx.mounter(&["zip"], false);
        for source in ["a.zip", "/home/chronos/../etc/a.zip"] {
            let result = mounter.mount(source, Path::new("/media/archive/a.zip"), Vec::new());
            assert_eq!(result.err(), Some(MountError::InvalidPath));
        }
    }

    #[test]
    fn test_archive_mount_arguments() {
        let fx = Fixture::new();
        fx.platform.add_path(Path::new("/home/chronos/u/a.zip"));
        let mounter = fx.mounter(&["zip"], false);

        let mp = mounter
            .mount(
                "/home/chronos/u/a.zip",
                Path::new("/media/archive/a.zip"),
                strings(&["password=hunter2"]),
            )
            .unwrap();
        assert!(mp.is_in_progress());
        assert!(mp.is_read_only());
        assert_eq!(mp.filesystem_type(), "fuse.archive");

        let process = fx.processes.last().unwrap();
        assert_eq!(
            process.arguments[..3],
            strings(&["-o", "ro,umask=0222,uid=1000,gid=1001", "/home/chronos/u/a.zip"])[..]
        );
        assert_eq!(process.stdin.as_deref(), Some("hunter2"));
        assert_eq!(
            process.bind_mounts,
            vec![(
                PathBuf::from("/home/chronos/u/a.zip"),
                PathBuf::from("/home/chronos/u/a.zip"),
                false,
                false
            )]
        );
        assert_eq!(fx.metrics.archive_types(), vec!["zip".to_string()]);
    }

    #[test]
    fn test_format_raw_option() {
        let fx = Fixture::new();
        fx.platform.add_path(Path::new("/home/chronos/u/log.gz"));
        let mounter = fx.mounter(&["gz"], true);
        mounter
            .mount("/home/chronos/u/log.gz", Path::new("/media/archive/log.gz"), Vec::new())
            .unwrap();
        assert_eq!(
            fx.processes.last().unwrap().arguments[1],
            "ro,umask=0222,uid=1000,gid=1001,formatraw"
        );
    }

    #[test]
    fn test_archive_resolved_in_namespace() {
        let fx = Fixture::new();
        fx.platform.add_namespace_path(Path::new("/home/chronos/u/a.zip"));
        let mounter = fx.mounter(&["zip"], false);

        mounter
            .mount("/home/chronos/u/a.zip", Path::new("/media/archive/a.zip"), Vec::new())
            .unwrap();
        assert_eq!(
            fx.processes.last().unwrap().existing_namespace,
            Some(PathBuf::from("/run/namespaces/mnt_chrome"))
        );
    }

    #[test]
    fn test_missing_archive() {
        let fx = Fixture::new();
        let mounter = fx.mounter(&["zip"], false);
        let result = mounter.mount("/home/chronos/u/none.zip", Path::new("/media/archive/none.zip"), Vec::new());
        assert_eq!(result.err(), Some(MountError::InvalidPath));
    }

    #[test]
    fn test_multipart_rar_binds_siblings() {
        let fx = Fixture::new();
        let dir = Path::new("/home/chronos/u");
        fx.platform.add_directory(dir);
        fx.platform.add_path(&dir.join("set.rar"));
        // The fake lists directories only; names are what matter here.
        for name in ["set.rar", "set.r00", "set.r01", "set.r1", "other.r00"] {
            fx.platform.add_directory(&dir.join(name));
        }
        let mounter = fx.mounter(&["rar"], false);
        mounter
            .mount("/home/chronos/u/set.rar", Path::new("/media/archive/set.rar"), Vec::new())
            .unwrap();

        let binds: Vec<PathBuf> = fx
            .processes
            .last()
            .unwrap()
            .bind_mounts
            .into_iter()
            .map(|(source, _, _, _)| source)
            .collect();
        assert_eq!(
            binds,
            vec![dir.join("set.rar"), dir.join("set.r00"), dir.join("set.r01")]
        );
    }

    #[test]
    fn test_multipart_sibling_names() {
        assert!(is_multipart_sibling("set.part1.rar", "set.part2.rar"));
        assert!(is_multipart_sibling("Set.Part01.RAR", "set.part10.rar"));
        assert!(!is_multipart_sibling("set.part1.rar", "set.r00"));
        assert!(!is_multipart_sibling("set.part1.rar", "other.part2.rar"));
        assert!(is_multipart_sibling("set.rar", "set.r07"));
        assert!(!is_multipart_sibling("set.rar", "set.r7"));
        assert!(!is_multipart_sibling("set.zip", "set.r00"));
    }

    #[test]
    fn test_password_exit_code_maps_to_need_password() {
        let fx = Fixture::new();
        fx.platform.add_path(Path::new("/home/chronos/u/a.rar"));
        let mounter = fx.mounter(&["rar"], false);
        let mut mp = mounter
            .mount("/home/chronos/u/a.rar", Path::new("/media/archive/a.rar"), Vec::new())
            .unwrap();
        assert_eq!(mp.on_launcher_exit(37), Some(MountError::NeedPassword));
        assert_eq!(fx.metrics.daemon_exit_codes(), vec![("archive".to_string(), 37)]);
    }
}
