//! Device Guard: decides whether a device is a safe target and gets every
//! one of its partitions unmounted.
//!
//! Unmounting races against desktop auto-mounters, so single failures are
//! logged and tolerated. The controller checks the mount table afterwards and
//! only then decides whether the device is still busy.

use crate::config::Settings;
use crate::error::{ImagingError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::platform;
use std::path::{Path, PathBuf};
use std::thread;

/// What an unmount pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnmountReport {
    /// Partitions that were unmounted.
    pub unmounted: Vec<String>,
    /// Partitions whose unmount command failed, with the diagnostic text.
    pub failed: Vec<(String, String)>,
}

pub struct DeviceGuard<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    boot_device: Option<PathBuf>,
}

impl<'a> DeviceGuard<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self {
        Self {
            runner,
            settings,
            boot_device: platform::boot_device(),
        }
    }

    /// Overrides the detected boot device.
    pub fn with_boot_device(mut self, boot: Option<PathBuf>) -> Self {
        self.boot_device = boot;
        self
    }

    /// Checks that `device` exists, is not the boot disk and is at least
    /// `min_device_bytes` large. Returns the size when it could be read; a
    /// failed size query only degrades the check.
    pub fn verify(&self, device: &Path) -> Result<Option<u64>> {
        let display = device.display().to_string();
        if !device.exists() {
            return Err(ImagingError::DeviceNotFound(display));
        }

        if let Some(boot) = &self.boot_device {
            let canonical = device.canonicalize().unwrap_or_else(|_| device.to_path_buf());
            if canonical == *boot || device == boot {
                return Err(ImagingError::unexpected(format!(
                    "{display} holds the running system and cannot be used as a target"
                )));
            }
        }

        let size = if device.is_file() {
            std::fs::metadata(device).map(|m| m.len()).ok()
        } else {
            platform::device_size(self.runner, self.settings, device)
        };

        match size {
            Some(size_bytes) if size_bytes < self.settings.min_device_bytes => {
                Err(ImagingError::TooSmall {
                    device: display,
                    size_bytes,
                    min_bytes: self.settings.min_device_bytes,
                })
            }
            Some(size_bytes) => {
                log::info!("{display} verified ({size_bytes} bytes)");
                Ok(Some(size_bytes))
            }
            None => {
                log::warn!("Could not determine the size of {display}, continuing without it");
                Ok(None)
            }
        }
    }

    /// Best-effort unmount of the whole device and then of each mounted
    /// partition. Never fails; individual failures are recorded in the report.
    pub fn unmount_all(&self, device: &Path) -> UnmountReport {
        let mut report = UnmountReport::default();
        let device_str = device.to_string_lossy().into_owned();

        // The whole device is usually not mounted itself; a failure is expected.
        if matches!(self.umount(&device_str), Ok(true)) {
            report.unmounted.push(device_str);
        }

        for (partition, mountpoint) in
            platform::mounted_partitions(self.runner, self.settings, device)
        {
            match self.umount(&partition) {
                Ok(true) => {
                    log::info!("Unmounted {partition} from {mountpoint}");
                    report.unmounted.push(partition);
                }
                Ok(false) => {
                    log::warn!("Could not unmount {partition} from {mountpoint}");
                    report.failed.push((partition, format!("still mounted at {mountpoint}")));
                }
                Err(e) => {
                    log::warn!("Could not unmount {partition}: {e}");
                    report.failed.push((partition, e.to_string()));
                }
            }
        }

        thread::sleep(self.settings.unmount_settle());
        report
    }

    /// Repeats [`unmount_all`](Self::unmount_all) after a delay when mounts
    /// remain. Returns the partitions that are still mounted afterwards.
    pub fn force_unmount(&self, device: &Path) -> Vec<String> {
        let remaining = self.mounted(device);
        if remaining.is_empty() {
            return remaining;
        }

        log::warn!(
            "{} still has mounted partitions ({}), retrying",
            device.display(),
            remaining.join(", ")
        );
        thread::sleep(self.settings.settle_long());
        self.unmount_all(device);
        self.mounted(device)
    }

    /// Mounted partitions of `device`, as `partition (mountpoint)` strings.
    pub fn mounted(&self, device: &Path) -> Vec<String> {
        platform::mounted_partitions(self.runner, self.settings, device)
            .into_iter()
            .map(|(part, mp)| format!("{part} ({mp})"))
            .collect()
    }

    fn umount(&self, target: &str) -> Result<bool> {
        let spec = CommandSpec::new("umount")
            .arg(target)
            .elevated(true)
            .timeout(self.settings.metadata_timeout());
        let out = self.runner.run(&spec)?;
        if !out.success() {
            log::debug!("umount {target}: {}", out.diagnostic());
        }
        Ok(out.success())
    }
}
