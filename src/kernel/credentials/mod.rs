//! UID/GID transitions for sandboxed daemons.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid.

mod transition;
mod validation;

pub use transition::child_transition_to_unprivileged;
pub use validation::validate_ids;
