use crate::config::Settings;
use crate::device::{BlockDevice, kernel_name, parent_device_path};
use crate::exec::{CommandRunner, CommandSpec, find_program};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Tools the pipeline shells out to, besides the configured copy tool.
const REQUIRED_TOOLS: &[&str] = &[
    "lsblk", "blockdev", "umount", "wipefs", "parted", "sfdisk", "partprobe", "mkfs.vfat", "ps",
    "kill",
];

/// A mounted (or mountable) entry under a disk, from `lsblk -l`.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionEntry {
    pub path: String,
    pub kind: String,
    pub mountpoint: Option<String>,
}

/// Helper to read a specific file from the /sys/block filesystem.
fn read_sys_file(sysfs_root: &Path, device_name: &str, file: &str) -> io::Result<String> {
    let path = sysfs_root.join("block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// The whole disk holding the root filesystem, if it can be determined.
pub fn boot_device() -> Option<PathBuf> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .map(|disk| {
            let name = PathBuf::from(disk.name());
            let path = if name.is_absolute() {
                name
            } else {
                PathBuf::from("/dev/").join(name)
            };
            parent_device_path(&path)
        })
}

/// Parses an lsblk size column: plain bytes (`-b`) or a suffixed size
/// such as `7.5G`.
pub fn parse_size(size_str: &str) -> u64 {
    let size_str = size_str.trim();
    if size_str.is_empty() {
        return 0;
    }
    if let Ok(bytes) = size_str.parse::<u64>() {
        return bytes;
    }

    let (num_str, suffix) = size_str.split_at(size_str.len() - 1);
    let multiplier: u64 = match suffix.to_ascii_uppercase().as_str() {
        "B" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        "P" => 1 << 50,
        _ => return 0,
    };

    num_str
        .trim()
        .replace(',', ".")
        .parse::<f64>()
        .map(|n| (n * multiplier as f64) as u64)
        .unwrap_or(0)
}

/// Parses `lsblk -d -n -b -o NAME,SIZE,TYPE,MOUNTPOINT,MODEL` output.
///
/// The filtering logic is as follows:
/// 1.  Skip anything whose TYPE is not `disk` (partitions, roms, lvm, ...).
/// 2.  Skip virtual devices (`loop*`, `ram*`, `zram*`).
/// 3.  Skip the disk the host is booted from.
/// 4.  Skip devices reporting a size of zero, which usually are empty card
///     readers.
///
/// The MOUNTPOINT column may be empty, in which case the model string starts
/// in the fourth field; mount points are recognised by their leading `/` or `[`.
/// The result is sorted by device path.
pub fn parse_device_listing(output: &str, boot: Option<&Path>) -> Vec<BlockDevice> {
    let mut devices: Vec<BlockDevice> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 || fields[2] != "disk" {
                return None;
            }

            let name = fields[0];
            if ["loop", "ram", "zram"].iter().any(|p| name.starts_with(p)) {
                return None;
            }

            let path = PathBuf::from("/dev/").join(name);
            if boot.is_some_and(|b| b == path) {
                log::debug!("Excluding boot device {}", path.display());
                return None;
            }

            let size_bytes = parse_size(fields[1]);
            if size_bytes == 0 {
                return None;
            }

            let rest = &fields[3..];
            let (mountpoint, model) = match rest.first() {
                Some(f) if f.starts_with('/') || f.starts_with('[') => (Some(*f), &rest[1..]),
                _ => (None, rest),
            };

            Some(BlockDevice {
                path: path.clone(),
                name: name.to_string(),
                size_bytes,
                removable: false,
                mounts: mountpoint
                    .map(|mp| vec![(path.to_string_lossy().into_owned(), mp.to_string())])
                    .unwrap_or_default(),
                model: model.join(" "),
            })
        })
        .collect();

    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

/// Parses `lsblk -l -n -o NAME,TYPE,MOUNTPOINT <device>` output.
pub fn parse_partition_listing(output: &str) -> Vec<PartitionEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let kind = fields.next()?;
            let mountpoint = fields.collect::<Vec<_>>().join(" ");
            Some(PartitionEntry {
                path: format!("/dev/{name}"),
                kind: kind.to_string(),
                mountpoint: (!mountpoint.is_empty()).then_some(mountpoint),
            })
        })
        .collect()
}

/// Runs a read-only query, retrying with elevation when the unprivileged
/// attempt fails and a credential is available.
fn query(runner: &dyn CommandRunner, spec: CommandSpec) -> Option<String> {
    match runner.run(&spec) {
        Ok(out) if out.success() => return Some(out.stdout),
        Ok(out) => log::debug!("{} failed: {}", spec.program, out.diagnostic()),
        Err(e) => log::debug!("{} failed: {e}", spec.program),
    }
    if runner.is_privileged() {
        return None;
    }
    match runner.run(&spec.elevated(true)) {
        Ok(out) if out.success() => Some(out.stdout),
        _ => None,
    }
}

/// Lists every partition (and the disk itself) with its mount point.
pub fn list_partitions(
    runner: &dyn CommandRunner,
    settings: &Settings,
    device: &Path,
) -> Option<Vec<PartitionEntry>> {
    let spec = CommandSpec::new("lsblk")
        .args(["-l", "-n", "-o", "NAME,TYPE,MOUNTPOINT"])
        .arg(device.to_string_lossy())
        .timeout(settings.metadata_timeout());
    query(runner, spec).map(|out| parse_partition_listing(&out))
}

/// Mounted entries of `device` as `(path, mountpoint)` pairs.
pub fn mounted_partitions(
    runner: &dyn CommandRunner,
    settings: &Settings,
    device: &Path,
) -> Vec<(String, String)> {
    list_partitions(runner, settings, device)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.mountpoint.map(|mp| (p.path, mp)))
        .collect()
}

/// Scans for candidate target devices on a Linux system.
///
/// Never fails: when the listing tool is missing or refuses to run, the
/// result is empty and the caller reports "no devices found". Repeated scans
/// return devices in the same order, so the first entry is a stable default.
pub fn list_removable_devices(runner: &dyn CommandRunner, settings: &Settings) -> Vec<BlockDevice> {
    let spec = CommandSpec::new("lsblk")
        .args(["-d", "-n", "-b", "-o", "NAME,SIZE,TYPE,MOUNTPOINT,MODEL"])
        .timeout(settings.metadata_timeout());

    let Some(output) = query(runner, spec) else {
        log::warn!("Could not list block devices");
        return Vec::new();
    };

    let boot = boot_device();
    let mut devices = parse_device_listing(&output, boot.as_deref());

    for device in &mut devices {
        device.removable = read_sys_file(&settings.sysfs_root, &device.name, "removable")
            .map(|s| s == "1")
            .unwrap_or(false);

        let mounts = mounted_partitions(runner, settings, &device.path);
        if !mounts.is_empty() {
            device.mounts = mounts;
        }
    }

    log::info!("Found {} candidate device(s)", devices.len());
    devices
}

/// Device size from sysfs (`size` is in 512-byte sectors).
pub fn sysfs_size_bytes(settings: &Settings, device: &Path) -> Option<u64> {
    read_sys_file(&settings.sysfs_root, &kernel_name(device), "size")
        .ok()?
        .parse::<u64>()
        .ok()
        .map(|sectors| sectors * 512)
        .filter(|&bytes| bytes > 0)
}

/// Device size in bytes: sysfs first, then `blockdev --getsize64`.
pub fn device_size(
    runner: &dyn CommandRunner,
    settings: &Settings,
    device: &Path,
) -> Option<u64> {
    if let Some(size) = sysfs_size_bytes(settings, device) {
        return Some(size);
    }
    let spec = CommandSpec::new("blockdev")
        .arg("--getsize64")
        .arg(device.to_string_lossy())
        .timeout(settings.metadata_timeout());
    query(runner, spec)?.trim().parse().ok()
}

/// Cumulative sectors written to `device`, the seventh field of
/// `/sys/block/<name>/stat`.
pub fn sectors_written(settings: &Settings, device: &Path) -> Option<u64> {
    read_sys_file(&settings.sysfs_root, &kernel_name(device), "stat")
        .ok()?
        .split_whitespace()
        .nth(6)?
        .parse()
        .ok()
}

/// External tools that are not installed, including the configured copy tool.
pub fn missing_tools(settings: &Settings) -> Vec<String> {
    std::iter::once(settings.copy_tool.as_str())
        .chain(REQUIRED_TOOLS.iter().copied())
        .filter(|tool| find_program(tool).is_none())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
sda      500107862016 disk                 Samsung SSD 860
sda1        536870912 part /boot/efi
sdc       15518924800 disk /media/alice/USB Kingston DataTraveler
sdb        8004304896 disk                 SanDisk Ultra
loop0        65011712 loop /snap/core
sr0        1073741312 rom
zram0      8589934592 disk [SWAP]
sdd                 0 disk                 Card Reader
";

    #[test]
    fn listing_excludes_boot_and_non_disks() {
        let devices = parse_device_listing(LISTING, Some(Path::new("/dev/sda")));
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["sdb", "sdc"]);
    }

    #[test]
    fn listing_is_sorted_by_path() {
        let devices = parse_device_listing(LISTING, None);
        let paths: Vec<_> = devices.iter().map(|d| d.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
        assert_eq!(devices[0].name, "sda");
    }

    #[test]
    fn listing_handles_missing_mountpoint_column() {
        let devices = parse_device_listing(LISTING, None);
        let sdb = devices.iter().find(|d| d.name == "sdb").unwrap();
        assert_eq!(sdb.model, "SanDisk Ultra");
        assert!(sdb.mounts.is_empty());
        assert_eq!(sdb.size_bytes, 8_004_304_896);

        let sdc = devices.iter().find(|d| d.name == "sdc").unwrap();
        assert_eq!(sdc.mounts, vec![("/dev/sdc".to_string(), "/media/alice/USB".to_string())]);
        assert_eq!(sdc.model, "Kingston DataTraveler");
    }

    #[test]
    fn human_sizes_are_understood() {
        assert_eq!(parse_size("8004304896"), 8_004_304_896);
        assert_eq!(parse_size("7.5G"), (7.5 * (1u64 << 30) as f64) as u64);
        assert_eq!(parse_size("512M"), 512 << 20);
        assert_eq!(parse_size("14,9G"), (14.9 * (1u64 << 30) as f64) as u64);
        assert_eq!(parse_size(""), 0);
        assert_eq!(parse_size("huge"), 0);
    }

    #[test]
    fn partition_listing_keeps_mountpoints_with_spaces() {
        let out = "sdb  disk\nsdb1 part /media/alice/My Stick\nsdb2 part\n";
        let parts = parse_partition_listing(out);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].path, "/dev/sdb1");
        assert_eq!(parts[1].mountpoint.as_deref(), Some("/media/alice/My Stick"));
        assert_eq!(parts[2].mountpoint, None);
    }

    #[test]
    fn sysfs_counters_are_read() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("block").join("sdz");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("size"), "15634432\n").unwrap();
        fs::write(
            dir.join("stat"),
            "  1234 0 5678 90 4321 0 987654 321 0 400 411 0 0 0 0\n",
        )
        .unwrap();

        let settings = Settings {
            sysfs_root: root.path().to_path_buf(),
            ..Settings::fast()
        };
        let dev = Path::new("/dev/sdz");
        assert_eq!(sysfs_size_bytes(&settings, dev), Some(15_634_432 * 512));
        assert_eq!(sectors_written(&settings, dev), Some(987_654));
        assert_eq!(sectors_written(&settings, Path::new("/dev/nope")), None);
    }
}
