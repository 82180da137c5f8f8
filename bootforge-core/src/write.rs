//! Write Engine: streams an image onto the raw device with the block-copy
//! tool and turns its output into [`WriteProgress`] updates.
//!
//! Two progress sources are supported:
//!
//! - **Tool progress**: the copy tool runs with `status=progress` and each
//!   line on its stderr (split on `\r` as well as `\n`) is parsed.
//! - **I/O counters**: when the tool has no progress mode, the device's
//!   sectors-written counter is sampled. Until a counter is seen, an assumed
//!   throughput provides an estimate capped well below completion.
//!
//! Success is decided solely by the tool's exit status. A cancelled write
//! leaves the device in an indeterminate state that needs reformatting.

use crate::config::Settings;
use crate::error::{ImagingError, Result};
use crate::exec::{CommandRunner, CommandSpec, find_program, terminate_child};
use crate::image::image_size;
use crate::operation::CancelFlag;
use crate::platform;
use crate::progress::{ProgressEvent, WriteProgress, parse_progress_line};
use std::collections::VecDeque;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Lines of tool output kept for the failure message.
const DIAGNOSTIC_LINES: usize = 5;

/// The pid of the copy tool while a write is running, so another thread can
/// signal it.
#[derive(Debug, Clone, Default)]
pub struct ActiveProcess(Arc<Mutex<Option<u32>>>);

impl ActiveProcess {
    pub fn get(&self) -> Option<u32> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, pid: Option<u32>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }
}

/// How progress is being derived for the current write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    ToolOutput,
    IoCounters,
}

pub struct WriteEngine<'a> {
    runner: &'a dyn CommandRunner,
    settings: &'a Settings,
    cancel: &'a CancelFlag,
    active: ActiveProcess,
}

impl<'a> WriteEngine<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: &'a Settings, cancel: &'a CancelFlag) -> Self {
        Self {
            runner,
            settings,
            cancel,
            active: ActiveProcess::default(),
        }
    }

    /// Publishes the copy tool's pid through `active` while it runs.
    pub fn with_active_process(mut self, active: ActiveProcess) -> Self {
        self.active = active;
        self
    }

    /// Whether the copy tool understands `status=progress`.
    pub fn detect_mode(&self) -> ProgressMode {
        let spec = CommandSpec::new(self.settings.copy_tool.as_str())
            .arg("--help")
            .timeout(self.settings.metadata_timeout());
        match self.runner.run(&spec) {
            Ok(out) if out.stdout.contains("progress") || out.stderr.contains("progress") => {
                ProgressMode::ToolOutput
            }
            _ => {
                log::info!(
                    "{} has no progress mode, sampling device I/O counters instead",
                    self.settings.copy_tool
                );
                ProgressMode::IoCounters
            }
        }
    }

    /// Writes `image` to `device`. `on_progress` receives every change of the
    /// tracker; it sees 100 % only after the copy tool exited successfully.
    pub fn write(
        &self,
        image: &Path,
        device: &Path,
        on_progress: &mut dyn FnMut(&WriteProgress),
    ) -> Result<()> {
        let total = image_size(image)?;
        self.cancel.check()?;

        if !self.settings.copy_tool.contains('/') && find_program(&self.settings.copy_tool).is_none()
        {
            return Err(ImagingError::write_failed(format!(
                "`{}` is not installed",
                self.settings.copy_tool
            )));
        }

        let mode = self.detect_mode();
        let mut spec = CommandSpec::new(self.settings.copy_tool.as_str())
            .arg(format!("if={}", image.display()))
            .arg(format!("of={}", device.display()))
            .arg(format!("bs={}", self.settings.block_size))
            .arg("conv=fsync")
            .elevated(true);
        if mode == ProgressMode::ToolOutput {
            spec = spec.arg("status=progress");
        }

        self.cancel.check()?;
        log::info!("Writing {} to {} ({total} bytes)", image.display(), device.display());
        let mut child = self.runner.spawn(&spec)?;
        self.active.set(Some(child.id()));

        let lines = spawn_line_reader(child.stderr.take());
        let mut progress = WriteProgress::new(total);
        on_progress(&progress);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_LINES);
        let mut sampler = IoSampler::new(self.settings, device);
        let started = Instant::now();

        let status = loop {
            if self.cancel.is_cancelled() {
                log::warn!("Write cancelled, stopping {}", self.settings.copy_tool);
                let stopped = terminate_child(self.runner, &mut child, self.settings.termination_grace());
                self.active.set(None);
                if let Err(e) = stopped {
                    log::warn!("Could not reap {}: {e}", self.settings.copy_tool);
                }
                return Err(ImagingError::Cancelled);
            }

            match lines.recv_timeout(self.settings.poll_interval()) {
                Ok(line) => self.handle_line(line, mode, &mut progress, &mut tail, on_progress),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Stderr closed; the tool is exiting.
                    match child.try_wait()? {
                        Some(status) => break status,
                        None => thread::sleep(self.settings.poll_interval()),
                    }
                }
            }

            if mode == ProgressMode::IoCounters && sampler.update(&mut progress, started.elapsed()) {
                on_progress(&progress);
            }

            if let Some(status) = child.try_wait()? {
                // Drain what the tool printed before exiting.
                while let Ok(line) = lines.recv_timeout(Duration::from_millis(100)) {
                    self.handle_line(line, mode, &mut progress, &mut tail, on_progress);
                }
                break status;
            }
        };
        self.active.set(None);

        if status.success() {
            progress.complete();
            on_progress(&progress);
            log::info!("Write to {} completed", device.display());
            return Ok(());
        }

        let detail = tail.into_iter().collect::<Vec<_>>().join("\n");
        let code = status
            .code()
            .map_or_else(|| "a signal".to_string(), |c| format!("exit code {c}"));
        Err(ImagingError::write_failed(self.runner.redact(&format!(
            "{} terminated with {code}: {}",
            self.settings.copy_tool,
            detail.trim()
        ))))
    }

    fn handle_line(
        &self,
        line: String,
        mode: ProgressMode,
        progress: &mut WriteProgress,
        tail: &mut VecDeque<String>,
        on_progress: &mut dyn FnMut(&WriteProgress),
    ) {
        let event = parse_progress_line(&line);
        if event == ProgressEvent::Unrecognized {
            log::debug!("{}: {}", self.settings.copy_tool, self.runner.redact(&line));
            if tail.len() == DIAGNOSTIC_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        } else if mode == ProgressMode::ToolOutput && progress.apply(event) {
            on_progress(progress);
        }
    }
}

/// Reads `pipe` on a separate thread and sends each `\r`- or `\n`-terminated
/// line, so the caller can wait with a timeout.
fn spawn_line_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let Some(pipe) = pipe else { return };
        let mut reader = BufReader::new(pipe);
        let mut buf = [0u8; 4096];
        let mut line = Vec::new();
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                if byte == b'\r' || byte == b'\n' {
                    if !line.is_empty() {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        line.clear();
                        if !text.is_empty() && tx.send(text).is_err() {
                            return;
                        }
                    }
                } else {
                    line.push(byte);
                }
            }
        }
        if !line.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&line).trim().to_string());
        }
    });
    rx
}

/// Fallback progress from the device's sectors-written counter.
struct IoSampler<'a> {
    settings: &'a Settings,
    device: &'a Path,
    baseline: Option<u64>,
    last_sample: Option<Instant>,
    seen_counter: bool,
}

impl<'a> IoSampler<'a> {
    fn new(settings: &'a Settings, device: &'a Path) -> Self {
        Self {
            settings,
            device,
            baseline: platform::sectors_written(settings, device),
            last_sample: None,
            seen_counter: false,
        }
    }

    /// Samples at most once per interval. Returns whether `progress` changed.
    fn update(&mut self, progress: &mut WriteProgress, elapsed: Duration) -> bool {
        let now = Instant::now();
        if self
            .last_sample
            .is_some_and(|last| now.duration_since(last) < self.settings.io_sample_interval())
        {
            return false;
        }
        self.last_sample = Some(now);

        let counter = platform::sectors_written(self.settings, self.device);
        match (self.baseline, counter) {
            (Some(base), Some(current)) if current > base => {
                self.seen_counter = true;
                progress.observe_bytes((current - base) * 512)
            }
            (None, Some(current)) => {
                self.baseline = Some(current);
                false
            }
            _ if self.seen_counter => false,
            _ => {
                let estimated =
                    elapsed.as_secs_f64() * self.settings.assumed_throughput_bytes_per_sec as f64;
                let percent = if progress.total() == 0 {
                    0.0
                } else {
                    estimated * 100.0 / progress.total() as f64
                };
                progress.observe_percent(percent, self.settings.estimate_cap_percent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use std::io::Write;

    fn image(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![1u8; len]).unwrap();
        file
    }

    fn settings() -> Settings {
        Settings {
            copy_tool: "sh".to_string(),
            ..Settings::fast()
        }
    }

    #[test]
    fn missing_image_fails_before_any_subprocess() {
        let runner = ScriptedRunner::new();
        let settings = settings();
        let cancel = CancelFlag::new();
        let engine = WriteEngine::new(&runner, &settings, &cancel);
        let err = engine
            .write(Path::new("/nonexistent.iso"), Path::new("/dev/sdz"), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, ImagingError::WriteFailed(_)));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn parsed_progress_reaches_100_only_on_success() {
        let runner = ScriptedRunner::new()
            .respond("sh --help", 0, "status=progress")
            .spawning(
                r#"printf '1000 bytes (1 kB) copied, 1 s\r2000 bytes (2 kB) copied, 2 s\r' >&2
                   printf '4096 bytes (4.1 kB) copied, 3 s\n' >&2; exit 0"#,
            );
        let settings = settings();
        let cancel = CancelFlag::new();
        let img = image(4096);
        let engine = WriteEngine::new(&runner, &settings, &cancel);

        let mut seen = Vec::new();
        engine
            .write(img.path(), Path::new("/dev/sdz"), &mut |p| seen.push(p.percent()))
            .unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100.0));
        assert_eq!(seen.iter().filter(|&&p| p == 100.0).count(), 1);

        let spawned = runner.specs().into_iter().find(|s| s.args.iter().any(|a| a.starts_with("of="))).unwrap();
        assert!(spawned.elevate);
        assert!(spawned.args.contains(&"status=progress".to_string()));
        assert!(spawned.args.contains(&"bs=4M".to_string()));
    }

    #[test]
    fn failing_tool_is_write_failed_with_its_stderr() {
        let runner = ScriptedRunner::new()
            .respond("sh --help", 0, "status=progress")
            .spawning("echo 'dd: error writing: No space left on device' >&2; exit 1");
        let settings = settings();
        let cancel = CancelFlag::new();
        let img = image(4096);
        let engine = WriteEngine::new(&runner, &settings, &cancel);

        let mut last = 0.0;
        let err = engine
            .write(img.path(), Path::new("/dev/sdz"), &mut |p| last = p.percent())
            .unwrap_err();
        assert!(matches!(err, ImagingError::WriteFailed(ref m) if m.contains("No space left")));
        assert!(last < 100.0);
    }

    #[test]
    fn failure_text_never_carries_the_password() {
        use crate::exec::Executor;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("noisy-dd");
        std::fs::write(&tool, "#!/bin/sh\necho \"noisy-dd: bad password hunter2-secret\" >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        let settings = Settings {
            copy_tool: tool.to_string_lossy().into_owned(),
            elevation_tool: crate::testing::fake_elevation_tool(dir.path())
                .to_string_lossy()
                .into_owned(),
            sysfs_root: dir.path().join("sys"),
            ..Settings::fast()
        };
        let exec = Executor::with_privilege(&settings, false);
        exec.authenticate("hunter2-secret").unwrap();

        let cancel = CancelFlag::new();
        let img = image(4096);
        let engine = WriteEngine::new(&exec, &settings, &cancel);
        let err = engine
            .write(img.path(), &dir.path().join("sdz"), &mut |_| {})
            .unwrap_err();
        let ImagingError::WriteFailed(message) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert!(message.contains("bad password ***"), "{message}");
        assert!(!message.contains("hunter2-secret"), "{message}");
    }

    #[test]
    fn cancellation_is_observed_within_a_poll_interval() {
        let runner = ScriptedRunner::new()
            .respond("sh --help", 0, "status=progress")
            .spawning("sleep 30");
        let settings = settings();
        let cancel = CancelFlag::new();
        let img = image(4096);
        let active = ActiveProcess::default();
        let engine = WriteEngine::new(&runner, &settings, &cancel).with_active_process(active.clone());

        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
            Instant::now()
        });

        let err = engine
            .write(img.path(), Path::new("/dev/sdz"), &mut |_| {})
            .unwrap_err();
        let returned = Instant::now();
        let requested = handle.join().unwrap();

        assert_eq!(err, ImagingError::Cancelled);
        assert!(returned.duration_since(requested) < settings.poll_interval() + settings.termination_grace() + Duration::from_millis(500));
        assert_eq!(active.get(), None);
    }

    #[test]
    fn fallback_estimate_is_capped() {
        let runner = ScriptedRunner::new()
            .respond("sh --help", 1, "")
            .spawning("sleep 1; exit 0");
        let settings = Settings {
            assumed_throughput_bytes_per_sec: 1 << 30,
            sysfs_root: tempfile::tempdir().unwrap().path().to_path_buf(),
            ..settings()
        };
        let cancel = CancelFlag::new();
        let img = image(4096);
        let engine = WriteEngine::new(&runner, &settings, &cancel);
        assert_eq!(engine.detect_mode(), ProgressMode::IoCounters);

        let mut seen = Vec::new();
        engine
            .write(img.path(), Path::new("/dev/sdz"), &mut |p| seen.push(p.percent()))
            .unwrap();
        let before_completion = &seen[..seen.len() - 1];
        assert!(before_completion.iter().all(|&p| p <= 80.0));
        assert!(before_completion.iter().any(|&p| p == 80.0));
        assert_eq!(seen.last(), Some(&100.0));

        let spawned = runner.specs().into_iter().find(|s| s.args.iter().any(|a| a.starts_with("of="))).unwrap();
        assert!(!spawned.args.contains(&"status=progress".to_string()));
    }

    #[test]
    fn line_reader_splits_carriage_returns() {
        let rx = spawn_line_reader(Some(&b"a\rb\r\nc\n\nd"[..]));
        let lines: Vec<String> = rx.iter().collect();
        assert_eq!(lines, vec!["a", "b", "c", "d"]);
    }
}
