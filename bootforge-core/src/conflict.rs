//! Conflict Detector: finds other block-copy processes writing to a device.
//!
//! Matching is textual. A process is a candidate when its command line runs
//! the copy tool with an `of=` argument, and it is dangerous when the device
//! path occurs in that `of=` target. A copy that only reads the device is not
//! dangerous. Symlinked aliases are missed and `/dev/sdb` also matches
//! `/dev/sdb1`; both are accepted.
//!
//! A writer started between the pre-partition and pre-write checks is a
//! residual race that is not closed here.

use crate::config::Settings;
use crate::exec::{CommandRunner, CommandSpec, signal_process};
use nix::sys::signal::Signal;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::thread;

/// A process that looks like it is writing to a block device.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictingProcess {
    pub pid: u32,
    /// The raw command line.
    pub command: String,
    /// The value of the first `of=` argument, when one could be extracted.
    pub target: Option<String>,
}

fn output_target_re() -> &'static Regex {
    static OUTPUT_TARGET_RE: OnceLock<Regex> = OnceLock::new();
    OUTPUT_TARGET_RE.get_or_init(|| Regex::new(r"of=([^\s']+)").expect("valid output target regex"))
}

/// Whether any whitespace token of `command` names `tool` (by basename).
fn runs_tool(command: &str, tool: &str) -> bool {
    let tool_name = Path::new(tool)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| tool.to_string());
    command.split_whitespace().any(|token| {
        Path::new(token)
            .file_name()
            .is_some_and(|n| n.to_string_lossy() == tool_name)
    })
}

/// Extracts writer candidates from `ps -eo pid=,args=` output, skipping the
/// pids in `exclude`, and keeps the ones that are dangerous for `device`
/// (all of them when no device is given).
pub fn parse_process_table(
    table: &str,
    tool: &str,
    exclude: &[u32],
    device: Option<&Path>,
) -> Vec<ConflictingProcess> {
    let device = device.map(|d| d.to_string_lossy().into_owned());
    table
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            let command = command.trim();

            if exclude.contains(&pid) || !command.contains("of=") || !runs_tool(command, tool) {
                return None;
            }

            let target = output_target_re()
                .captures(command)
                .map(|caps| caps[1].to_string());

            let dangerous = match &device {
                Some(dev) => target.as_deref().is_some_and(|t| t.contains(dev.as_str())),
                None => true,
            };
            dangerous.then(|| ConflictingProcess {
                pid,
                command: command.to_string(),
                target,
            })
        })
        .collect()
}

pub struct ConflictDetector<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
}

impl<'a> ConflictDetector<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings) -> Self {
        Self { runner, settings }
    }

    /// Scans the process table for writers. Returns whether any dangerous
    /// writer was found, together with the dangerous processes.
    ///
    /// A scan that cannot run is logged and reported as "nothing found".
    pub fn scan_for_writers(&self, device: Option<&Path>) -> (bool, Vec<ConflictingProcess>) {
        let spec = CommandSpec::new("ps")
            .args(["-eo", "pid=,args="])
            .timeout(self.settings.metadata_timeout());

        let table = match self.runner.run(&spec) {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                log::warn!("Process scan failed: {}", out.diagnostic());
                return (false, Vec::new());
            }
            Err(e) => {
                log::warn!("Process scan failed: {e}");
                return (false, Vec::new());
            }
        };

        let exclude = [std::process::id(), nix::unistd::getppid().as_raw() as u32];
        let found = parse_process_table(&table, &self.settings.copy_tool, &exclude, device);
        for proc in &found {
            log::warn!("Conflicting writer PID {}: {}", proc.pid, proc.command);
        }
        (!found.is_empty(), found)
    }

    /// Force-kills every process in `processes`, waits for the grace period
    /// and re-scans. Returns whether the danger set for `device` is now empty.
    pub fn terminate(&self, device: Option<&Path>, processes: &[ConflictingProcess]) -> bool {
        for proc in processes {
            if signal_process(self.runner, proc.pid, Signal::SIGKILL) {
                log::info!("Killed conflicting writer PID {}", proc.pid);
            } else {
                log::warn!("Could not kill conflicting writer PID {}", proc.pid);
            }
        }
        thread::sleep(self.settings.termination_grace());

        let (dangerous, _) = self.scan_for_writers(device);
        !dangerous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;

    const TABLE: &str = "\
    1 /sbin/init splash
  812 sudo -S dd if=ubuntu.iso of=/dev/sdx bs=4M status=progress
  813 dd if=ubuntu.iso of=/dev/sdx bs=4M status=progress
  900 /usr/bin/dd if=/dev/zero of=/dev/sdy1 bs=1M count=10
  901 vim notes-about-dd-of=/dev/sdx.txt
  950 dd if=/dev/sda of=backup.img
  951 dd if=/dev/sdx of=/tmp/backup.img bs=4M
 4242 dd of=/dev/sdx bs=4M
";

    #[test]
    fn dangerous_writers_target_the_device() {
        let found = parse_process_table(TABLE, "dd", &[], Some(Path::new("/dev/sdx")));
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![812, 813, 4242]);
        assert_eq!(found[2].command, "dd of=/dev/sdx bs=4M");
        assert_eq!(found[2].target.as_deref(), Some("/dev/sdx"));
    }

    #[test]
    fn no_device_means_every_candidate() {
        let found = parse_process_table(TABLE, "dd", &[], None);
        let pids: Vec<u32> = found.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![812, 813, 900, 950, 951, 4242]);
        assert_eq!(found[3].target.as_deref(), Some("backup.img"));
    }

    #[test]
    fn reading_the_device_is_not_a_conflict() {
        let found = parse_process_table(
            "950 dd if=/dev/sdb of=/tmp/backup.img bs=4M\n",
            "dd",
            &[],
            Some(Path::new("/dev/sdb")),
        );
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn own_processes_are_excluded() {
        let found = parse_process_table(TABLE, "dd", &[812, 813], Some(Path::new("/dev/sdx")));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 4242);
    }

    #[test]
    fn partition_paths_match_by_substring() {
        let found = parse_process_table(TABLE, "dd", &[], Some(Path::new("/dev/sdy")));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, 900);
    }

    #[test]
    fn terminated_writers_disappear_on_rescan() {
        let runner = ScriptedRunner::new()
            .respond_once("ps", 0, "  99999999 dd of=/dev/sdx bs=4M\n")
            .respond("ps", 0, "  1 /sbin/init\n");
        let settings = Settings::fast();
        let detector = ConflictDetector::new(&runner, &settings);
        let device = Path::new("/dev/sdx");

        let (dangerous, found) = detector.scan_for_writers(Some(device));
        assert!(dangerous);
        assert_eq!(
            found,
            vec![ConflictingProcess {
                pid: 99_999_999,
                command: "dd of=/dev/sdx bs=4M".to_string(),
                target: Some("/dev/sdx".to_string()),
            }]
        );

        // The pid is above any kernel pid_max, so the kill fails quietly and
        // the re-scan decides the result.
        assert!(detector.terminate(Some(device), &found));
        assert_eq!(detector.scan_for_writers(Some(device)), (false, Vec::new()));
    }

    #[test]
    fn failed_scan_reports_nothing() {
        let runner = ScriptedRunner::new().fail("ps", "ps: not found");
        let settings = Settings::fast();
        let detector = ConflictDetector::new(&runner, &settings);
        assert_eq!(detector.scan_for_writers(None), (false, Vec::new()));
    }
}
