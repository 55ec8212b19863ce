use super::{MAX_CAP, PR_CAPBSET_DROP, PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, PR_SET_NO_NEW_PRIVS};
use std::io;

/// Remove every capability from the bounding set.
///
/// Numbers the kernel does not know return EINVAL and are skipped. Any other
/// failure (typically EPERM without CAP_SETPCAP) aborts the sandbox.
pub fn child_drop_bounding_set() -> io::Result<()> {
    for cap in 0..=MAX_CAP {
        // SAFETY: prctl(PR_CAPBSET_DROP) takes a plain integer argument.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Clear the ambient set; older kernels without ambient support are ignored
pub fn child_clear_ambient_capabilities() {
    // SAFETY: constant arguments.
    let _ = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
}

/// Prevent privilege escalation via execve (setuid, file capabilities).
/// Idempotent and irreversible once set.
pub fn child_set_no_new_privs() -> io::Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is idempotent.
    let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_ambient_capabilities_is_idempotent() {
        child_clear_ambient_capabilities();
        child_clear_ambient_capabilities();
    }

    #[test]
    fn test_set_no_new_privs_is_idempotent() {
        let first = child_set_no_new_privs();
        let second = child_set_no_new_privs();
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
