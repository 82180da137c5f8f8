//! Partition/Format Engine: gives the device a fresh MS-DOS label with one
//! FAT32 partition.
//!
//! Three strategies are tried in order of increasing aggressiveness:
//!
//! 1. [`SimpleStrategy`]: `wipefs`, `parted mklabel`, `parted mkpart`,
//!    `parted set 1 boot on`, `mkfs.vfat`.
//! 2. [`AlternativeStrategy`]: `wipefs`, a scripted `sfdisk` table, `mkfs.vfat`.
//! 3. [`ManualStrategy`]: unmount again, zero the first 10 MiB, `wipefs`,
//!    `partprobe`, `parted`, `partprobe`, `mkfs.vfat`.
//!
//! A failing required command aborts only its strategy. The later strategies
//! treat their clean-up commands (signature wipes, zeroing, `partprobe`) and
//! the boot flag as best-effort: a failure there is logged and the strategy
//! carries on. Cancellation is checked before and after every command and
//! during every settle delay.

use crate::config::Settings;
use crate::device::partition_path;
use crate::error::{ImagingError, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::guard::DeviceGuard;
use crate::operation::{CancelFlag, OperationState};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Table written by [`AlternativeStrategy`]: one bootable FAT32 (LBA)
/// partition starting at sector 2048 and filling the disk.
const SFDISK_SCRIPT: &str = "label: dos\nstart=2048, type=c, bootable\n";

/// Everything a strategy needs to run its commands.
pub struct FormatContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub settings: &'a Settings,
    pub device: &'a Path,
    pub cancel: &'a CancelFlag,
    pub on_state: &'a dyn Fn(OperationState),
}

impl FormatContext<'_> {
    fn device_str(&self) -> String {
        self.device.to_string_lossy().into_owned()
    }

    fn partition(&self) -> String {
        partition_path(self.device, 1)
    }

    fn enter(&self, state: OperationState) {
        (self.on_state)(state);
    }

    /// Runs one step of `strategy`. A non-zero exit, a timeout or a tool that
    /// cannot be started becomes [`ImagingError::FormatFailed`] carrying the
    /// command's output. Cancellation and credential errors pass through.
    fn step(&self, strategy: &str, spec: CommandSpec) -> Result<()> {
        self.cancel.check()?;
        let spec = spec
            .elevated(true)
            .timeout(self.settings.metadata_timeout());
        let line = spec.command_line();
        let result = self.runner.run(&spec);
        // An interrupted command reports a plain failure; it must not read as
        // a reason to try the next strategy.
        self.cancel.check()?;
        let out = result.map_err(|e| match e {
            ImagingError::Cancelled
            | ImagingError::CredentialMissing
            | ImagingError::CredentialInvalid(_) => e,
            other => ImagingError::FormatFailed {
                strategy: strategy.to_string(),
                stderr: format!("{line}: {other}"),
            },
        })?;
        if out.success() {
            Ok(())
        } else {
            Err(ImagingError::FormatFailed {
                strategy: strategy.to_string(),
                stderr: format!("{line}: {}", out.diagnostic()),
            })
        }
    }

    /// Like [`step`](Self::step), but a [`ImagingError::FormatFailed`] is only
    /// logged.
    fn try_step(&self, strategy: &str, spec: CommandSpec) -> Result<()> {
        match self.step(strategy, spec) {
            Err(ImagingError::FormatFailed { stderr, .. }) => {
                log::warn!("{strategy} strategy: ignoring failed step: {stderr}");
                Ok(())
            }
            other => other,
        }
    }

    /// Sleeps for `delay`, waking up at least every poll interval to observe
    /// cancellation.
    fn settle(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now() + delay;
        loop {
            self.cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(self.settings.poll_interval()));
        }
    }

    fn wipe_signatures(&self, strategy: &str, required: bool) -> Result<()> {
        self.enter(OperationState::Wiping);
        let wipe = CommandSpec::new("wipefs").args(["--all", "--force"]).arg(self.device_str());
        if required {
            self.step(strategy, wipe)?;
        } else {
            self.try_step(strategy, wipe)?;
        }
        self.settle(self.settings.settle_short())
    }

    fn parted_label_and_partition(&self, strategy: &str) -> Result<()> {
        self.enter(OperationState::Partitioning);
        self.step(
            strategy,
            CommandSpec::new("parted")
                .arg("-s")
                .arg(self.device_str())
                .args(["mklabel", "msdos"]),
        )?;
        self.settle(self.settings.settle_short())?;
        self.step(
            strategy,
            CommandSpec::new("parted")
                .arg("-s")
                .arg(self.device_str())
                .args(["mkpart", "primary", "fat32", "1MiB", "100%"]),
        )?;
        self.try_step(
            strategy,
            CommandSpec::new("parted")
                .arg("-s")
                .arg(self.device_str())
                .args(["set", "1", "boot", "on"]),
        )?;
        self.settle(self.settings.settle_long())
    }

    fn reread_partition_table(&self, strategy: &str) -> Result<()> {
        self.try_step(strategy, CommandSpec::new("partprobe").arg(self.device_str()))?;
        self.settle(self.settings.settle_long())
    }

    fn make_filesystem(&self, strategy: &str) -> Result<()> {
        self.enter(OperationState::Formatting);
        self.step(
            strategy,
            CommandSpec::new("mkfs.vfat")
                .args(["-F", "32", "-n"])
                .arg(self.settings.volume_label.as_str())
                .arg(self.partition()),
        )?;
        self.settle(self.settings.settle_short())
    }
}

/// One way of getting a device from any state to "one FAT32 partition".
pub trait FormatStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn attempt(&self, ctx: &FormatContext<'_>) -> Result<()>;
}

pub struct SimpleStrategy;

impl FormatStrategy for SimpleStrategy {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn attempt(&self, ctx: &FormatContext<'_>) -> Result<()> {
        ctx.wipe_signatures(self.name(), true)?;
        ctx.parted_label_and_partition(self.name())?;
        ctx.make_filesystem(self.name())
    }
}

pub struct AlternativeStrategy;

impl FormatStrategy for AlternativeStrategy {
    fn name(&self) -> &'static str {
        "alternative"
    }

    fn attempt(&self, ctx: &FormatContext<'_>) -> Result<()> {
        ctx.wipe_signatures(self.name(), false)?;

        ctx.enter(OperationState::Partitioning);
        ctx.step(
            self.name(),
            CommandSpec::new("sfdisk")
                .arg(ctx.device_str())
                .stdin(SFDISK_SCRIPT),
        )?;
        ctx.settle(ctx.settings.settle_long())?;

        ctx.make_filesystem(self.name())
    }
}

pub struct ManualStrategy;

impl FormatStrategy for ManualStrategy {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn attempt(&self, ctx: &FormatContext<'_>) -> Result<()> {
        ctx.cancel.check()?;
        DeviceGuard::new(ctx.runner, ctx.settings).unmount_all(ctx.device);

        ctx.enter(OperationState::Wiping);
        ctx.try_step(
            self.name(),
            CommandSpec::new("dd")
                .arg("if=/dev/zero")
                .arg(format!("of={}", ctx.device_str()))
                .args(["bs=1M", "count=10", "conv=fsync"]),
        )?;
        ctx.settle(ctx.settings.settle_short())?;
        ctx.try_step(
            self.name(),
            CommandSpec::new("wipefs").args(["--all", "--force"]).arg(ctx.device_str()),
        )?;
        ctx.reread_partition_table(self.name())?;

        ctx.parted_label_and_partition(self.name())?;
        ctx.reread_partition_table(self.name())?;

        ctx.make_filesystem(self.name())
    }
}

/// Runs strategies in order until one succeeds.
pub struct FormatEngine {
    strategies: Vec<Box<dyn FormatStrategy>>,
}

impl Default for FormatEngine {
    fn default() -> Self {
        Self::new(vec![
            Box::new(SimpleStrategy),
            Box::new(AlternativeStrategy),
            Box::new(ManualStrategy),
        ])
    }
}

impl FormatEngine {
    pub fn new(strategies: Vec<Box<dyn FormatStrategy>>) -> Self {
        Self { strategies }
    }

    /// Returns the name of the strategy that succeeded. Exhausting every
    /// strategy yields the last strategy's [`ImagingError::FormatFailed`];
    /// cancellation and missing credentials abort immediately.
    pub fn run(&self, ctx: &FormatContext<'_>) -> Result<&'static str> {
        let mut last_error = ImagingError::FormatFailed {
            strategy: "none".to_string(),
            stderr: "no formatting strategy configured".to_string(),
        };

        for strategy in &self.strategies {
            ctx.cancel.check()?;
            log::info!("Formatting {} ({} strategy)", ctx.device.display(), strategy.name());
            match strategy.attempt(ctx) {
                Ok(()) => {
                    log::info!("{} strategy succeeded", strategy.name());
                    return Ok(strategy.name());
                }
                Err(e @ ImagingError::FormatFailed { .. }) => {
                    log::warn!("{e}");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }
}
