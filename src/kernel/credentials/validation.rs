//! Credential validation logic.

use crate::config::types::{MountError, MountResult};

/// Daemons never run as root (uid or gid 0).
pub fn validate_ids(uid: u32, gid: u32) -> MountResult<()> {
    if uid == 0 || gid == 0 {
        log::error!(
            "Refusing to run a sandboxed daemon as root (uid={}, gid={})",
            uid,
            gid
        );
        return Err(MountError::InsufficientPermissions);
    }
    Ok(())
}
