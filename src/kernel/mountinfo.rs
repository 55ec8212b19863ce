/// Mount table parsing from /proc/self/mountinfo
use crate::config::types::{MountboxError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Mount entry from /proc/self/mountinfo
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MountEntry {
    pub mount_id: u32,
    pub parent_id: u32,
    pub device: String,
    pub mount_point: PathBuf,
    pub mount_options: String,
    pub filesystem_type: String,
    pub source: String,
}

/// Parse /proc/self/mountinfo
pub fn parse_mountinfo() -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string("/proc/self/mountinfo").map_err(|e| {
        MountboxError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read /proc/self/mountinfo: {}", e),
        ))
    })?;

    Ok(parse_mountinfo_content(&content))
}

pub fn parse_mountinfo_content(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_mountinfo_line).collect()
}

/// Format: mount_id parent_id major:minor root mount_point options [optional...] - fs_type source super_options
fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() < 10 {
        return None;
    }

    let mount_id = parts[0].parse::<u32>().ok()?;
    let parent_id = parts[1].parse::<u32>().ok()?;
    let device = parts[2].to_string();
    let mount_point = PathBuf::from(unescape_octal(parts[4]));
    let mount_options = parts[5].to_string();

    let sep_pos = parts.iter().position(|&p| p == "-")?;
    if sep_pos + 2 >= parts.len() {
        return None;
    }

    Some(MountEntry {
        mount_id,
        parent_id,
        device,
        mount_point,
        mount_options,
        filesystem_type: parts[sep_pos + 1].to_string(),
        source: unescape_octal(parts[sep_pos + 2]),
    })
}

/// The kernel escapes space, tab, newline and backslash as `\NNN`
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let parsed = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = parsed {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points strictly below `root`, deepest first so they can be
/// unmounted in order
pub fn mount_points_under(entries: &[MountEntry], root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = entries
        .iter()
        .filter(|e| e.mount_point != root && e.mount_point.starts_with(root))
        .map(|e| e.mount_point.clone())
        .collect();
    paths.sort_by(|a, b| b.components().count().cmp(&a.components().count()));
    paths.dedup();
    paths
}
