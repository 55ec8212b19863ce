//! Configuration
//!
//! Shared error and result types, and the JSON-backed manager settings.

pub mod settings;
pub mod types;
