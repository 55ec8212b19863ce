/// Structured audit records for mount operations
///
/// Each record is one JSON line emitted under the `mountbox::audit` log
/// target, so deployments can route it separately from diagnostics.
use crate::config::types::MountError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "mountbox::audit";

/// Audited operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountAuditKind {
    Mount,
    Remount,
    Unmount,
    UnmountAll,
    LauncherExit,
    StaleCleanup,
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountAuditEvent {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MountAuditKind,
    pub source: String,
    pub mount_path: Option<String>,
    pub filesystem_type: Option<String>,
    pub read_only: Option<bool>,
    pub error: Option<MountError>,
    pub duration_ms: Option<u64>,
    pub pid: Option<i32>,
    pub exit_code: Option<i32>,
}

impl MountAuditEvent {
    pub fn new(kind: MountAuditKind, source: &str) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            source: source.to_string(),
            mount_path: None,
            filesystem_type: None,
            read_only: None,
            error: None,
            duration_ms: None,
            pid: None,
            exit_code: None,
        }
    }

    pub fn with_mount_path(mut self, mount_path: &Path) -> Self {
        self.mount_path = Some(mount_path.display().to_string());
        self
    }

    pub fn with_filesystem_type(mut self, filesystem_type: &str) -> Self {
        if !filesystem_type.is_empty() {
            self.filesystem_type = Some(filesystem_type.to_string());
        }
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn with_error(mut self, error: Option<MountError>) -> Self {
        self.error = error;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_launcher_exit(mut self, pid: i32, exit_code: i32) -> Self {
        self.pid = Some(pid);
        self.exit_code = Some(exit_code);
        self
    }

    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"request_id\":\"{}\",\"serialization_error\":\"{}\"}}",
                self.request_id, e
            )
        })
    }

    /// Emit under the audit target; failures other than `InProgress` log at warn
    pub fn emit(&self) {
        let line = self.to_json_line();
        match self.error {
            None | Some(MountError::InProgress) => log::info!(target: AUDIT_TARGET, "{}", line),
            Some(_) => log::warn!(target: AUDIT_TARGET, "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serialization() {
        let event = MountAuditEvent::new(MountAuditKind::Mount, "/dev/sdb1")
            .with_mount_path(Path::new("/media/removable/USB Drive"))
            .with_filesystem_type("vfat")
            .with_read_only(false)
            .with_error(Some(MountError::UnknownFilesystem))
            .with_duration(Duration::from_millis(12));

        let value: serde_json::Value = serde_json::from_str(&event.to_json_line()).unwrap();
        assert_eq!(value["kind"], "mount");
        assert_eq!(value["source"], "/dev/sdb1");
        assert_eq!(value["mount_path"], "/media/removable/USB Drive");
        assert_eq!(value["filesystem_type"], "vfat");
        assert_eq!(value["error"], "UnknownFilesystem");
        assert_eq!(value["duration_ms"], 12);
        assert!(Uuid::parse_str(value["request_id"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_empty_filesystem_type_is_omitted() {
        let event = MountAuditEvent::new(MountAuditKind::Unmount, "x").with_filesystem_type("");
        assert!(event.filesystem_type.is_none());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = MountAuditEvent::new(MountAuditKind::Mount, "a");
        let b = MountAuditEvent::new(MountAuditKind::Mount, "a");
        assert_ne!(a.request_id, b.request_id);
    }
}
