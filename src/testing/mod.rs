//! Testing infrastructure
//!
//! In-memory collaborators so managers and mounters run without root.

pub mod fakes;

pub use fakes::*;
