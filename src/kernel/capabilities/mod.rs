//! Capability drops applied to sandboxed filesystem daemons.
//!
//! Everything here runs in the forked child before exec: no allocation,
//! no logging, and failures surface as `std::io::Error`.

mod drop;

pub use drop::{child_clear_ambient_capabilities, child_drop_bounding_set, child_set_no_new_privs};

/// Highest capability number probed when clearing the bounding set
pub const MAX_CAP: libc::c_ulong = 40;

pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_ulong = 4;
