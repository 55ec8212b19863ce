//! Mount option algebra.
//!
//! Options travel as comma-joined ASCII tokens, each a bare flag (`ro`,
//! `nodev`) or a `key=value` pair. No token may itself contain a comma.

use crate::config::types::{MountError, MountResult};
use std::fmt;

/// Kernel mount flag mask as passed to mount(2)
pub type MountFlags = libc::c_ulong;

/// MS_NOSYMFOLLOW (Linux 5.10+); not exported by every libc release
pub const MS_NOSYMFOLLOW: MountFlags = 256;

pub const OPTION_BIND: &str = "bind";
pub const OPTION_DIRSYNC: &str = "dirsync";
pub const OPTION_FLUSH: &str = "flush";
pub const OPTION_NODEV: &str = "nodev";
pub const OPTION_NOEXEC: &str = "noexec";
pub const OPTION_NOSUID: &str = "nosuid";
pub const OPTION_NOSYMFOLLOW: &str = "nosymfollow";
pub const OPTION_READ_ONLY: &str = "ro";
pub const OPTION_READ_WRITE: &str = "rw";
pub const OPTION_REMOUNT: &str = "remount";
pub const OPTION_SYNCHRONOUS: &str = "sync";
pub const OPTION_UTF8: &str = "utf8";

const BUILTIN_ALLOWED_OPTIONS: [&str; 12] = [
    OPTION_BIND,
    OPTION_DIRSYNC,
    OPTION_FLUSH,
    OPTION_NODEV,
    OPTION_NOEXEC,
    OPTION_NOSUID,
    OPTION_NOSYMFOLLOW,
    OPTION_READ_ONLY,
    OPTION_READ_WRITE,
    OPTION_REMOUNT,
    OPTION_SYNCHRONOUS,
    OPTION_UTF8,
];

const SECURITY_OPTIONS: [&str; 3] = [OPTION_NODEV, OPTION_NOEXEC, OPTION_NOSUID];

/// Parsed and normalized option set for one mount attempt
#[derive(Clone, Debug)]
pub struct MountOptions {
    allowed_options: Vec<String>,
    allowed_prefixes: Vec<String>,
    enforced_options: Vec<String>,
    options: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allowed_options: Vec::new(),
            allowed_prefixes: Vec::new(),
            enforced_options: Vec::new(),
            options: vec![OPTION_READ_ONLY.to_string()],
        }
    }
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow an exact option string
    pub fn allow_option(&mut self, option: &str) {
        self.allowed_options.push(option.to_string());
    }

    /// Allow every option starting with `prefix` (e.g. `"umask="`)
    pub fn allow_option_prefix(&mut self, prefix: &str) {
        self.allowed_prefixes.push(prefix.to_string());
    }

    /// Always append `option`; shadows a caller option with the same name
    pub fn enforce_option(&mut self, option: &str) {
        self.enforced_options.push(option.to_string());
    }

    /// Rebuild the option list from caller-supplied options.
    ///
    /// Read/write mode follows the last `ro`/`rw` occurrence and defaults to
    /// read-only. `uid=`/`gid=` come from the caller when `set_user_and_group_id`
    /// is true, otherwise from the non-empty defaults.
    pub fn initialize(
        &mut self,
        options: &[String],
        set_user_and_group_id: bool,
        default_user_id: &str,
        default_group_id: &str,
    ) {
        self.options.clear();

        let mut read_write = false;
        let mut user_id: Option<String> = None;
        let mut group_id: Option<String> = None;
        let mut extras = Vec::new();

        for option in options {
            match option.as_str() {
                OPTION_READ_ONLY => read_write = false,
                OPTION_READ_WRITE => read_write = true,
                o if SECURITY_OPTIONS.contains(&o) => {}
                o if o.starts_with("uid=") => {
                    if set_user_and_group_id {
                        user_id = Some(option.clone());
                    }
                }
                o if o.starts_with("gid=") => {
                    if set_user_and_group_id {
                        group_id = Some(option.clone());
                    }
                }
                o if self.is_shadowed_by_enforced(o) => {
                    log::debug!("Mount option '{}' is overridden by an enforced option", o);
                }
                o if self.is_allowed(o) => extras.push(option.clone()),
                o => log::warn!("Ignoring unsupported mount option '{}'", o),
            }
        }

        if user_id.is_none() && !default_user_id.is_empty() {
            user_id = Some(format!("uid={}", default_user_id));
        }
        if group_id.is_none() && !default_group_id.is_empty() {
            group_id = Some(format!("gid={}", default_group_id));
        }

        self.options = extras;
        self.options.extend(self.enforced_options.iter().cloned());
        self.options.push(
            if read_write {
                OPTION_READ_WRITE
            } else {
                OPTION_READ_ONLY
            }
            .to_string(),
        );
        self.options.extend(user_id);
        self.options.extend(group_id);
        self.options
            .extend(SECURITY_OPTIONS.iter().map(|o| o.to_string()));
    }

    fn is_allowed(&self, option: &str) -> bool {
        BUILTIN_ALLOWED_OPTIONS.contains(&option)
            || self.allowed_options.iter().any(|o| o == option)
            || self.allowed_prefixes.iter().any(|p| option.starts_with(p.as_str()))
            || self.enforced_options.iter().any(|o| o == option)
    }

    fn is_shadowed_by_enforced(&self, option: &str) -> bool {
        let name = param_name(option);
        self.enforced_options.iter().any(|o| param_name(o) == name)
    }

    pub fn is_read_only_option_set(&self) -> bool {
        is_read_only_mount(&self.options)
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Options for a FUSE daemon command line; the kernel-only `nosymfollow`
    /// is dropped.
    pub fn to_fuse_mounter_options(&self) -> String {
        self.options
            .iter()
            .filter(|o| o.as_str() != OPTION_NOSYMFOLLOW)
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Split recognized boolean options into a flag mask; everything else is
    /// returned as comma-joined mount data.
    pub fn to_mount_flags_and_data(&self) -> (MountFlags, String) {
        let mut flags: MountFlags = 0;
        let mut data = Vec::new();

        for option in &self.options {
            match option.as_str() {
                OPTION_BIND => flags |= libc::MS_BIND,
                OPTION_DIRSYNC => flags |= libc::MS_DIRSYNC,
                OPTION_NODEV => flags |= libc::MS_NODEV,
                OPTION_NOEXEC => flags |= libc::MS_NOEXEC,
                OPTION_NOSUID => flags |= libc::MS_NOSUID,
                OPTION_NOSYMFOLLOW => flags |= MS_NOSYMFOLLOW,
                OPTION_READ_ONLY => flags |= libc::MS_RDONLY,
                OPTION_READ_WRITE => flags &= !libc::MS_RDONLY,
                OPTION_REMOUNT => flags |= libc::MS_REMOUNT,
                OPTION_SYNCHRONOUS => flags |= libc::MS_SYNCHRONOUS,
                _ => data.push(option.as_str()),
            }
        }

        (flags, data.join(","))
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.options.join(","))
    }
}

fn param_name(param: &str) -> &str {
    param.split_once('=').map(|(name, _)| name).unwrap_or(param)
}

/// True if the last `ro`/`rw` token is `ro`
pub fn is_read_only_mount(params: &[String]) -> bool {
    for param in params.iter().rev() {
        match param.as_str() {
            OPTION_READ_ONLY => return true,
            OPTION_READ_WRITE => return false,
            _ => {}
        }
    }
    false
}

/// Value of the last `name=value` parameter
pub fn get_param_value(params: &[String], name: &str) -> Option<String> {
    params.iter().rev().find_map(|param| {
        param
            .split_once('=')
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value.to_string())
    })
}

pub fn set_param_value(params: &mut Vec<String>, name: &str, value: &str) {
    params.push(format!("{}={}", name, value));
}

pub fn has_exact_param(params: &[String], param: &str) -> bool {
    params.iter().any(|p| p == param)
}

/// Remove every parameter equal to `param`; returns how many were removed
pub fn remove_params_equal_to(params: &mut Vec<String>, param: &str) -> usize {
    let before = params.len();
    params.retain(|p| p != param);
    before - params.len()
}

/// Remove every `name=...` parameter; returns how many were removed
pub fn remove_params_with_same_name(params: &mut Vec<String>, name: &str) -> usize {
    let before = params.len();
    params.retain(|p| param_name(p) != name || !p.contains('='));
    before - params.len()
}

/// Join parameters into one option string, rejecting tokens with commas
pub fn join_params_into_options(params: &[String]) -> MountResult<String> {
    if let Some(bad) = params.iter().find(|p| p.contains(',')) {
        log::error!("Mount parameter '{}' contains a comma", bad);
        return Err(MountError::InvalidMountOptions);
    }
    Ok(params.join(","))
}
