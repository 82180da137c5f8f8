//! Tunable settings for the imaging pipeline.
//!
//! All values have defaults, so a settings file only needs the fields it wants
//! to override. Durations are expressed in milliseconds in the JSON form.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Upper bound for the cancellation polling interval.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// Timeout for listing, sizing, unmounting and formatting commands.
    pub metadata_timeout_ms: u64,
    /// Timeout for the credential test.
    pub auth_timeout_ms: u64,
    /// Pause after a destructive command before the next one relies on it.
    pub settle_short_ms: u64,
    /// Longer pause used around partition table re-reads.
    pub settle_long_ms: u64,
    /// Pause after an unmount pass.
    pub unmount_settle_ms: u64,
    /// Devices below this size are rejected.
    pub min_device_bytes: u64,
    /// The block-copy tool.
    pub copy_tool: String,
    /// The privilege-escalation tool. Must accept `-S` (password on stdin).
    pub elevation_tool: String,
    /// Block size handed to the copy tool.
    pub block_size: String,
    /// Label given to the FAT32 volume.
    pub volume_label: String,
    /// How often cancellation is observed while waiting on subprocesses.
    pub poll_interval_ms: u64,
    /// How often the device I/O counters are sampled in fallback mode.
    pub io_sample_interval_ms: u64,
    /// Assumed throughput before any I/O counter has been observed.
    pub assumed_throughput_bytes_per_sec: u64,
    /// Ceiling for estimated progress that has not been confirmed.
    pub estimate_cap_percent: f64,
    /// How long a terminated subprocess gets before it is killed.
    pub termination_grace_ms: u64,
    /// Where the kernel's sysfs is mounted.
    pub sysfs_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            metadata_timeout_ms: 30_000,
            auth_timeout_ms: 10_000,
            settle_short_ms: 1_000,
            settle_long_ms: 3_000,
            unmount_settle_ms: 2_000,
            min_device_bytes: 100 * MIB,
            copy_tool: "dd".to_string(),
            elevation_tool: "sudo".to_string(),
            block_size: "4M".to_string(),
            volume_label: "USB_BOOT".to_string(),
            poll_interval_ms: 500,
            io_sample_interval_ms: 2_000,
            assumed_throughput_bytes_per_sec: 10 * MIB,
            estimate_cap_percent: 80.0,
            termination_grace_ms: 2_000,
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from the default location when `path`
    /// is `None`. A missing default file yields the defaults; an explicitly
    /// named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_dir() {
                Some(dir) => (dir.join("settings.json"), false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                anyhow::bail!("Settings file {} does not exist", path.display());
            }
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings: Settings = serde_json::from_str(&text)
            .with_context(|| format!("Malformed settings file {}", path.display()))?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Settings with every delay zeroed and short timeouts, for tests.
    pub fn fast() -> Self {
        Self {
            metadata_timeout_ms: 5_000,
            auth_timeout_ms: 5_000,
            settle_short_ms: 0,
            settle_long_ms: 0,
            unmount_settle_ms: 0,
            poll_interval_ms: 50,
            io_sample_interval_ms: 100,
            termination_grace_ms: 500,
            ..Self::default()
        }
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn settle_short(&self) -> Duration {
        Duration::from_millis(self.settle_short_ms)
    }

    pub fn settle_long(&self) -> Duration {
        Duration::from_millis(self.settle_long_ms)
    }

    pub fn unmount_settle(&self) -> Duration {
        Duration::from_millis(self.unmount_settle_ms)
    }

    /// The polling interval, never longer than [`MAX_POLL_INTERVAL`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).min(MAX_POLL_INTERVAL)
    }

    pub fn io_sample_interval(&self) -> Duration {
        Duration::from_millis(self.io_sample_interval_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

/// `$XDG_CONFIG_HOME/bootforge`, falling back to `$HOME/.config/bootforge`.
pub fn default_config_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("bootforge"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("bootforge"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "copy_tool": "/usr/local/bin/dd", "poll_interval_ms": 250 }}"#).unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.copy_tool, "/usr/local/bin/dd");
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(settings.min_device_bytes, 100 * MIB);
        assert_eq!(settings.volume_label, "USB_BOOT");
    }

    #[test]
    fn poll_interval_is_clamped() {
        let settings = Settings {
            poll_interval_ms: 5_000,
            ..Settings::default()
        };
        assert_eq!(settings.poll_interval(), MAX_POLL_INTERVAL);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(Settings::load(Some(&missing)).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(Settings::load(Some(file.path())).is_err());
    }
}
