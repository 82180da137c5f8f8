use std::fmt;
use std::path::{Path, PathBuf};

/// A whole-disk block device discovered by an inventory scan.
///
/// Instances are snapshots: they are built fresh on every scan and must be
/// re-scanned after any partitioning or formatting, since mount points and
/// sizes may have changed.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockDevice {
    /// The system path to the device (e.g., `/dev/sdb`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sdb").
    pub name: String,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// Whether the kernel flags the device as removable.
    pub removable: bool,
    /// Mounted partitions as `(partition path, mount point)`, in listing order.
    pub mounts: Vec<(String, String)>,
    /// The vendor model string, if the kernel exposes one.
    pub model: String,
}

impl BlockDevice {
    pub fn is_mounted(&self) -> bool {
        !self.mounts.is_empty()
    }

    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = match self.mounts.first() {
            Some((_, mp)) if self.mounts.len() == 1 => format!("[Mounted at {mp}]"),
            Some(_) => format!("[{} partitions mounted]", self.mounts.len()),
            None => "[Not mounted]".to_string(),
        };
        let model = if self.model.is_empty() {
            "Unknown model"
        } else {
            self.model.as_str()
        };

        write!(
            f,
            "{:<15} {:>7.1} GB  {:<24} {}",
            self.path.display(),
            self.size_gb(),
            model,
            mount_info
        )
    }
}

/// Returns the whole-disk path a partition belongs to
/// (`/dev/sda1` -> `/dev/sda`, `/dev/nvme0n1p2` -> `/dev/nvme0n1`).
pub fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") || path_str.starts_with("/dev/vd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.rfind('p') {
            if path_str[index + 1..].chars().all(|c| c.is_ascii_digit())
                && index + 1 < path_str.len()
            {
                return PathBuf::from(&path_str[..index]);
            }
        }
    }

    path.to_path_buf()
}

/// Returns the path of partition `number` on `device`. Devices whose name
/// ends in a digit use a `p` separator (`/dev/nvme0n1p1`, `/dev/mmcblk0p1`).
pub fn partition_path(device: &Path, number: u32) -> String {
    let base = device.to_string_lossy();
    if base.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{base}p{number}")
    } else {
        format!("{base}{number}")
    }
}

/// The kernel name of a device path (`/dev/sdb` -> `sdb`).
pub fn kernel_name(device: &Path) -> String {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
