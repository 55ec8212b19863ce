//! Credential switch performed in the forked child.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid to prevent
//! privilege escalation through saved-set-user-ID.

use std::io;

/// groups -> setresgid -> setresuid -> verify.
///
/// `groups` replaces the supplementary group list (empty clears it). The ids
/// were checked by `validate_ids` in the parent.
pub fn child_transition_to_unprivileged(uid: u32, gid: u32, groups: &[libc::gid_t]) -> io::Result<()> {
    // SAFETY: the pointer and length describe a live slice.
    if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // CRITICAL: GID before UID
    // SAFETY: setresgid atomically sets all three GIDs.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: setresuid atomically sets all three UIDs.
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: getters have no preconditions.
    let (real_uid, effective_uid) = unsafe { (libc::getuid(), libc::geteuid()) };
    let (real_gid, effective_gid) = unsafe { (libc::getgid(), libc::getegid()) };
    if real_uid != uid || effective_uid != uid || real_gid != gid || effective_gid != gid {
        return Err(io::Error::from_raw_os_error(libc::EPERM));
    }
    Ok(())
}
