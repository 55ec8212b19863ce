/// Running kernel and release channel facts used to gate kernel drivers
use std::cmp::Ordering;
use std::fmt;

/// `major.minor` kernel version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the leading `X.Y` of a release string such as `6.6.12-rc3+`
    pub fn parse(release: &str) -> Option<Self> {
        let mut parts = release.trim().split(|c: char| !c.is_ascii_digit());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some(Self { major, minor })
    }

    /// Version of the running kernel from uname(2)
    pub fn running() -> Option<Self> {
        let uts = nix::sys::utsname::uname().ok()?;
        let release = uts.release().to_string_lossy();
        let version = Self::parse(&release);
        if version.is_none() {
            log::warn!("Cannot parse kernel release {:?}", release);
        }
        version
    }
}

impl PartialOrd for KernelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KernelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Whether a kernel driver gated on `minimum` and `channels` may be registered.
///
/// An empty channel list allows every channel.
pub fn kernel_driver_allowed(
    running: Option<KernelVersion>,
    minimum: KernelVersion,
    channel: &str,
    channels: &[String],
) -> bool {
    if !channels.is_empty() && !channels.iter().any(|c| c == channel) {
        log::debug!("Release channel {} not in {:?}", channel, channels);
        return false;
    }
    match running {
        Some(version) => version >= minimum,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_strings() {
        assert_eq!(KernelVersion::parse("6.6.12"), Some(KernelVersion::new(6, 6)));
        assert_eq!(
            KernelVersion::parse("5.15.0-91-generic"),
            Some(KernelVersion::new(5, 15))
        );
        assert_eq!(KernelVersion::parse("6.1-rc3"), Some(KernelVersion::new(6, 1)));
        assert_eq!(KernelVersion::parse("garbage"), None);
        assert_eq!(KernelVersion::parse("6"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(KernelVersion::new(6, 1) > KernelVersion::new(5, 15));
        assert!(KernelVersion::new(5, 15) >= KernelVersion::new(5, 15));
        assert!(KernelVersion::new(5, 4) < KernelVersion::new(5, 10));
    }

    #[test]
    fn test_kernel_driver_gate() {
        let channels = vec!["dev".to_string(), "beta".to_string()];
        let min = KernelVersion::new(5, 15);

        assert!(kernel_driver_allowed(Some(KernelVersion::new(6, 1)), min, "dev", &channels));
        assert!(!kernel_driver_allowed(Some(KernelVersion::new(6, 1)), min, "stable", &channels));
        assert!(!kernel_driver_allowed(Some(KernelVersion::new(5, 10)), min, "dev", &channels));
        assert!(kernel_driver_allowed(Some(KernelVersion::new(5, 15)), min, "stable", &[]));
        assert!(!kernel_driver_allowed(None, min, "dev", &[]));
    }

    #[test]
    fn test_running_kernel_is_parseable() {
        assert!(KernelVersion::running().is_some());
    }
}
