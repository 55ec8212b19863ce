//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: mountinfo -> namespace -> capabilities -> credentials -> process

pub mod capabilities;
pub mod credentials;
pub mod mountinfo;
pub mod namespace;
pub mod platform;
pub mod process;
pub mod release;
