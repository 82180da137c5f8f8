//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use bootforge_core::exec::{CommandOutput, CommandRunner, CommandSpec};
use bootforge_core::{ImagingError, Result, Settings};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Answers `run` from a prefix table and records every call. `spawn` really
/// executes the requested program, so a script can stand in for the copy tool.
pub struct FakeRunner {
    responses: Mutex<Vec<(String, CommandOutput)>>,
    calls: Mutex<Vec<String>>,
    blocking: Mutex<Vec<String>>,
    interrupted: AtomicBool,
    privileged: bool,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            blocking: Mutex::new(Vec::new()),
            interrupted: AtomicBool::new(false),
            privileged: true,
        }
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    pub fn respond(self, prefix: &str, code: i32, stdout: &str, stderr: &str) -> Self {
        self.responses.lock().unwrap().push((
            prefix.to_string(),
            CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    /// Matching commands hang until interrupted, then report death by signal.
    pub fn block(self, prefix: &str) -> Self {
        self.blocking.lock().unwrap().push(prefix.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.split_whitespace().next().map(str::to_string))
            .collect()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        self.calls.lock().unwrap().push(line.clone());
        let blocks = self.blocking.lock().unwrap().iter().any(|p| line.starts_with(p.as_str()));
        if blocks {
            while !self.interrupted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            return Ok(CommandOutput::default());
        }
        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            }))
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        self.calls.lock().unwrap().push(spec.command_line());
        Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ImagingError::unexpected(e.to_string()))
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn interrupt(&self) -> usize {
        self.interrupted.store(true, Ordering::SeqCst);
        1
    }
}

/// A workspace with an image, a file standing in for the target device and
/// a fake copy tool.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub image: PathBuf,
    pub device: PathBuf,
    pub copy_tool: PathBuf,
}

/// A `dd` lookalike: copies `if=` to `of=` and prints progress lines the way
/// GNU dd does. `SLEEP` before copying keeps it busy for cancellation tests.
const FAKE_DD: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    if=*) src="${arg#if=}" ;;
    of=*) dst="${arg#of=}" ;;
  esac
done
sleep "${SLEEP:-0}" 2>/dev/null
size=$(wc -c < "$src")
half=$((size / 2))
printf '%s bytes (%s B) copied, 0.1 s, 1 MB/s\r' "$half" "$half" >&2
cat "$src" > "$dst" || exit 1
printf '%s bytes (%s B) copied, 0.2 s, 1 MB/s\n' "$size" "$size" >&2
echo "1+0 records in" >&2
echo "1+0 records out" >&2
"#;

impl Fixture {
    pub fn new(image_bytes: &[u8], sleep_secs: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.iso");
        std::fs::write(&image, image_bytes).unwrap();

        let device = dir.path().join("sdz");
        std::fs::write(&device, vec![0u8; 64 * 1024]).unwrap();

        let copy_tool = dir.path().join("fake-dd");
        let script = FAKE_DD.replace("${SLEEP:-0}", &sleep_secs.to_string());
        let mut file = std::fs::File::create(&copy_tool).unwrap();
        file.write_all(script.as_bytes()).unwrap();
        drop(file);
        std::fs::set_permissions(&copy_tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        Self {
            dir,
            image,
            device,
            copy_tool,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            copy_tool: self.copy_tool.to_string_lossy().into_owned(),
            min_device_bytes: 1024,
            sysfs_root: self.dir.path().join("sys"),
            ..Settings::fast()
        }
    }

    /// The `--help` check prefix, so the fake tool reports a progress mode.
    pub fn help_prefix(&self) -> String {
        format!("{} --help", self.copy_tool.display())
    }

    pub fn device_str(&self) -> String {
        self.device.to_string_lossy().into_owned()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn is_destructive(call: &str) -> bool {
    let program = call.split_whitespace().next().unwrap_or("");
    let name = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    matches!(
        name.as_str(),
        "wipefs" | "parted" | "sfdisk" | "mkfs.vfat" | "partprobe" | "dd" | "fake-dd"
    ) && !call.ends_with("--help")
}
