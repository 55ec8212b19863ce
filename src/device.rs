/// Block device snapshots and the collaborators that produce or act on them
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Physical media class reported by the disk monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMediaType {
    Unknown,
    Usb,
    Sd,
    OpticalDisc,
    Mobile,
    Dvd,
}

impl DeviceMediaType {
    /// Directory name used when a disk has neither label nor uuid
    pub fn default_name(self) -> &'static str {
        match self {
            DeviceMediaType::Usb => "USB Drive",
            DeviceMediaType::Sd => "SD Card",
            DeviceMediaType::OpticalDisc => "Optical Disc",
            DeviceMediaType::Mobile => "Mobile Device",
            DeviceMediaType::Dvd => "DVD",
            DeviceMediaType::Unknown => "External Drive",
        }
    }

    pub fn is_optical(self) -> bool {
        matches!(self, DeviceMediaType::OpticalDisc | DeviceMediaType::Dvd)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceMediaType::Unknown => "unknown",
            DeviceMediaType::Usb => "usb",
            DeviceMediaType::Sd => "sd",
            DeviceMediaType::OpticalDisc => "optical_disc",
            DeviceMediaType::Mobile => "mobile",
            DeviceMediaType::Dvd => "dvd",
        }
    }
}

impl Default for DeviceMediaType {
    fn default() -> Self {
        DeviceMediaType::Unknown
    }
}

/// Snapshot of one block device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Sysfs path identifying the device (e.g. `/sys/devices/.../block/sdb/sdb1`)
    pub device_path: String,
    /// Device node (e.g. `/dev/sdb1`); empty when the node is gone
    pub device_file: String,
    pub filesystem_type: String,
    pub label: String,
    pub uuid: String,
    pub media_type: DeviceMediaType,
    pub is_on_boot_device: bool,
    pub is_read_only: bool,
}

impl Disk {
    /// Name for the mount directory: label with `/` replaced, else uuid, else
    /// the media default
    pub fn presentation_name(&self) -> String {
        if !self.label.is_empty() {
            return self.label.replace('/', "_");
        }
        if !self.uuid.is_empty() {
            return self.uuid.clone();
        }
        self.media_type.default_name().to_string()
    }

    pub fn is_optical_disk(&self) -> bool {
        self.media_type.is_optical()
    }
}

/// Source of `Disk` snapshots (udev in production)
pub trait DiskMonitor {
    /// Accepts a sysfs path or a device node
    fn get_disk_by_device_path(&self, device_path: &Path) -> Option<Disk>;
}

/// Physical media ejection
pub trait DeviceEjector {
    fn eject(&self, device_file: &str) -> bool;
}
