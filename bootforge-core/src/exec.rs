//! Runs external commands, optionally through the privilege-escalation tool.
//!
//! Every subprocess the pipeline starts goes through a [`CommandRunner`]. The
//! production implementation is [`Executor`], which:
//!
//! - pipes the stored [`Credential`] to `sudo -S` when elevation is requested
//!   and the process is not already running as root,
//! - refuses to spawn anything when elevation is needed but no credential is
//!   stored ([`ImagingError::CredentialMissing`]),
//! - enforces a hard timeout and kills the child's whole process group when
//!   it expires,
//! - redacts the credential from every captured stream before returning it.
//!
//! Children are started in their own process group with a parent-death signal
//! so a crashing front-end never leaves a destructive command running.

use crate::config::Settings;
use crate::error::{ImagingError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use wait_timeout::ChildExt;
use zeroize::Zeroizing;

const AUTH_MARKER: &str = "bootforge_auth_ok";
const REDACTED: &str = "***";

/// How long a timed-out or interrupted group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// An elevation token.
pub enum Credential {
    /// The process already runs with full privileges; nothing is piped.
    AlreadyPrivileged,
    /// A password handed to the elevation tool on stdin. Wiped on drop.
    Password(Zeroizing<String>),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyPrivileged => f.write_str("Credential::AlreadyPrivileged"),
            Self::Password(_) => f.write_str("Credential::Password(<redacted>)"),
        }
    }
}

/// Description of a command to run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Text written to the child's stdin (after the credential, if elevated).
    pub stdin: Option<String>,
    pub elevate: bool,
    /// Falls back to the metadata timeout when `None`.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, text: impl Into<String>) -> Self {
        self.stdin = Some(text.into());
        self
    }

    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The command as a human would type it. Never contains the credential.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `None` when the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// The most useful fragment for an error message: stderr if non-empty,
    /// otherwise stdout.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if stdout.is_empty() {
            format!("exit code {}", self.code.map_or("?".to_string(), |c| c.to_string()))
        } else {
            stdout.to_string()
        }
    }
}

/// The seam between the pipeline and the operating system.
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion, capturing both streams.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Starts a long-running command. Stdout is discarded and stderr is piped;
    /// the caller owns the child and must reap it.
    fn spawn(&self, spec: &CommandSpec) -> Result<Child>;

    /// Whether commands already run with full privileges.
    fn is_privileged(&self) -> bool;

    /// Whether elevated commands can run without further input.
    fn has_credential(&self) -> bool {
        self.is_privileged()
    }

    /// Validates and stores an elevation credential.
    fn authenticate(&self, _password: &str) -> Result<()> {
        Ok(())
    }

    /// Removes any secret from `text` before it is logged or surfaced.
    fn redact(&self, text: &str) -> String {
        text.to_string()
    }

    /// Asks every command currently inside [`run`](Self::run) to stop.
    /// Returns how many were signalled.
    fn interrupt(&self) -> usize {
        0
    }
}

/// The production [`CommandRunner`].
pub struct Executor {
    elevation_tool: String,
    default_timeout: Duration,
    auth_timeout: Duration,
    privileged: bool,
    credential: Mutex<Option<Credential>>,
    running: Mutex<Vec<u32>>,
}

/// Keeps a pid in [`Executor::running`] for as long as it lives.
struct Tracked<'a> {
    running: &'a Mutex<Vec<u32>>,
    pid: u32,
}

impl<'a> Tracked<'a> {
    fn new(running: &'a Mutex<Vec<u32>>, pid: u32) -> Self {
        running.lock().unwrap_or_else(PoisonError::into_inner).push(pid);
        Self { running, pid }
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|&pid| pid != self.pid);
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("elevation_tool", &self.elevation_tool)
            .field("privileged", &self.privileged)
            .field("has_credential", &self.has_credential())
            .finish()
    }
}

impl Executor {
    /// Creates an executor, detecting whether the process runs as root.
    pub fn new(settings: &Settings) -> Self {
        Self::with_privilege(settings, nix::unistd::geteuid().is_root())
    }

    pub fn with_privilege(settings: &Settings, privileged: bool) -> Self {
        let credential = privileged.then_some(Credential::AlreadyPrivileged);
        Self {
            elevation_tool: settings.elevation_tool.clone(),
            default_timeout: settings.metadata_timeout(),
            auth_timeout: settings.auth_timeout(),
            privileged,
            credential: Mutex::new(credential),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn clear_credential(&self) {
        if self.privileged {
            return;
        }
        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Stops the process group led by `child`: SIGTERM first, SIGKILL when it
    /// is still alive after [`KILL_GRACE`].
    fn stop_group(&self, child: &mut Child) {
        let pgid = child.id();
        signal_group(self, pgid, Signal::SIGTERM);
        if matches!(child.wait_timeout(KILL_GRACE), Ok(Some(_))) {
            // The leader is gone; take the rest of the group with it.
            signal_group(self, pgid, Signal::SIGKILL);
            return;
        }
        if !signal_group(self, pgid, Signal::SIGKILL) {
            let _ = child.kill();
        }
        let _ = child.wait();
    }

    /// Builds the OS command for `spec` and the bytes to feed its stdin.
    fn prepare(&self, spec: &CommandSpec) -> Result<(Command, Option<Zeroizing<String>>)> {
        let secret = if spec.elevate && !self.privileged {
            let guard = self.credential.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(Credential::Password(pw)) => Some(Zeroizing::new(pw.to_string())),
                Some(Credential::AlreadyPrivileged) => None,
                None => return Err(ImagingError::CredentialMissing),
            }
        } else {
            None
        };

        let (mut cmd, payload) = match secret {
            Some(secret) => {
                // -k forces a prompt every time so the password line is always
                // consumed by the elevation tool and never reaches the command.
                let mut cmd = Command::new(&self.elevation_tool);
                cmd.args(["-S", "-k", "-p", "", "--"])
                    .arg(&spec.program)
                    .args(&spec.args);
                let mut text = Zeroizing::new(String::with_capacity(secret.len() + 1));
                text.push_str(&secret);
                text.push('\n');
                if let Some(stdin) = &spec.stdin {
                    text.push_str(stdin);
                }
                log::debug!("Running (elevated): {}", spec.command_line());
                (cmd, Some(text))
            }
            None => {
                let mut cmd = Command::new(&spec.program);
                cmd.args(&spec.args);
                log::debug!("Running: {}", spec.command_line());
                (cmd, spec.stdin.clone().map(Zeroizing::new))
            }
        };

        cmd.in_new_process_group();
        Ok((cmd, payload))
    }
}

impl CommandRunner for Executor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let (mut cmd, payload) = self.prepare(spec)?;

        cmd.stdin(if payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(&spec.program, e))?;
        let _tracked = Tracked::new(&self.running, child.id());

        if let (Some(payload), Some(mut stdin)) = (payload, child.stdin.take()) {
            std::thread::spawn(move || {
                let _ = stdin.write_all(payload.as_bytes());
            });
        }

        // Drain both pipes concurrently so a chatty child never blocks.
        let stdout_handle = drain(child.stdout.take());
        let stderr_handle = drain(child.stderr.take());

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                log::warn!("{} exceeded {timeout:?}, killing its process group", spec.program);
                self.stop_group(&mut child);
                // A descendant that left the group may still hold the pipes;
                // the drain threads are left to finish on their own.
                drop(stdout_handle);
                drop(stderr_handle);
                return Err(ImagingError::Timeout {
                    program: spec.program.clone(),
                    after: timeout,
                });
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        let output = CommandOutput {
            code: status.code(),
            stdout: self.redact(&String::from_utf8_lossy(&stdout)),
            stderr: self.redact(&String::from_utf8_lossy(&stderr)),
        };

        if !output.success() {
            log::debug!(
                "{} exited with {:?}: {}",
                spec.program,
                output.code,
                output.diagnostic()
            );
        }
        Ok(output)
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        let (mut cmd, payload) = self.prepare(spec)?;
        cmd.stdin(if payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| spawn_error(&spec.program, e))?;
        if let (Some(payload), Some(mut stdin)) = (payload, child.stdin.take()) {
            stdin.write_all(payload.as_bytes())?;
        }
        Ok(child)
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn has_credential(&self) -> bool {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Validates `password` against the elevation tool and stores it on
    /// success. A rejected password clears any previously stored credential.
    fn authenticate(&self, password: &str) -> Result<()> {
        if self.privileged {
            return Ok(());
        }

        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = Some(
            Credential::Password(Zeroizing::new(password.to_string())),
        );

        let check = CommandSpec::new("echo")
            .arg(AUTH_MARKER)
            .elevated(true)
            .timeout(self.auth_timeout);

        let verdict = match self.run(&check) {
            Ok(out) if out.success() && out.stdout.contains(AUTH_MARKER) => Ok(()),
            Ok(out) => Err(ImagingError::CredentialInvalid(out.diagnostic())),
            Err(ImagingError::Timeout { after, .. }) => Err(ImagingError::CredentialInvalid(
                format!("no answer from {} within {after:?}", self.elevation_tool),
            )),
            Err(e) => Err(ImagingError::CredentialInvalid(e.to_string())),
        };

        if verdict.is_err() {
            log::warn!("Credential rejected by {}", self.elevation_tool);
            self.clear_credential();
        } else {
            log::info!("Credential accepted by {}", self.elevation_tool);
        }
        verdict
    }

    fn redact(&self, text: &str) -> String {
        let guard = self.credential.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(Credential::Password(pw)) => redact_secret(text, pw),
            _ => text.to_string(),
        }
    }

    /// Sends SIGTERM to the process group of every running command. The
    /// interrupted `run` calls return with the signal's exit status.
    fn interrupt(&self) -> usize {
        let pids = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for &pid in &pids {
            log::info!("Interrupting process group {pid}");
            signal_group(self, pid, Signal::SIGTERM);
        }
        pids.len()
    }
}

/// Replaces every occurrence of `secret` in `text`.
pub fn redact_secret(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        return text.to_string();
    }
    text.replace(secret, REDACTED)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn spawn_error(program: &str, err: io::Error) -> ImagingError {
    if err.kind() == io::ErrorKind::NotFound {
        ImagingError::unexpected(format!("`{program}` is not installed or not in PATH"))
    } else {
        ImagingError::unexpected(format!("failed to start `{program}`: {err}"))
    }
}

/// Looks `program` up the way a shell would.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Sends `sig` to `pid`.
pub fn send_signal(pid: u32, sig: Signal) -> nix::Result<()> {
    signal::kill(Pid::from_raw(pid as i32), sig)
}

/// Sends `sig` to `pid`, retrying through the elevation tool when the kernel
/// refuses an unprivileged signal (e.g. a `sudo`-owned child).
pub fn signal_process(runner: &dyn CommandRunner, pid: u32, sig: Signal) -> bool {
    deliver(runner, send_signal(pid, sig), &pid.to_string(), sig)
}

/// Sends `sig` to every process in the group `pgid`, with the same elevated
/// retry as [`signal_process`].
pub fn signal_group(runner: &dyn CommandRunner, pgid: u32, sig: Signal) -> bool {
    let result = signal::killpg(Pid::from_raw(pgid as i32), sig);
    deliver(runner, result, &format!("-{pgid}"), sig)
}

fn deliver(runner: &dyn CommandRunner, result: nix::Result<()>, target: &str, sig: Signal) -> bool {
    match result {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) if !runner.is_privileged() => {
            let name = sig.as_str().trim_start_matches("SIG");
            let spec = CommandSpec::new("kill")
                .args(["-s", name, "--", target])
                .elevated(true);
            match runner.run(&spec) {
                Ok(out) => out.success(),
                Err(e) => {
                    log::warn!("Could not signal {target}: {e}");
                    false
                }
            }
        }
        Err(e) => {
            log::warn!("Could not signal {target}: {e}");
            false
        }
    }
}

/// Asks a child to stop with SIGTERM and kills it if it is still alive after
/// `grace`.
pub fn terminate_child(
    runner: &dyn CommandRunner,
    child: &mut Child,
    grace: Duration,
) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }
    signal_process(runner, child.id(), Signal::SIGTERM);
    if let Some(status) = child.wait_timeout(grace)? {
        return Ok(status);
    }
    log::warn!("PID {} ignored SIGTERM, sending SIGKILL", child.id());
    if !signal_process(runner, child.id(), Signal::SIGKILL) {
        let _ = child.kill();
    }
    child.wait()
}

/// Extension trait for [`Command`] to isolate children from the terminal's
/// process group and tie their lifetime to ours.
pub trait CommandProcessGroup {
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            self.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(io::Error::from)?;
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(privileged: bool) -> Executor {
        Executor::with_privilege(&Settings::fast(), privileged)
    }

    #[test]
    fn elevation_without_credential_never_spawns() {
        let exec = executor(false);
        // A program that cannot exist: if anything were spawned we would see
        // a "not installed" error instead.
        let spec = CommandSpec::new("/nonexistent/definitely-not-here").elevated(true);
        assert_eq!(exec.run(&spec), Err(ImagingError::CredentialMissing));
        assert!(matches!(exec.spawn(&spec), Err(ImagingError::CredentialMissing)));
    }

    #[test]
    fn privileged_executor_runs_elevated_commands_directly() {
        let exec = executor(true);
        let out = exec
            .run(&CommandSpec::new("sh").args(["-c", "echo hi"]).elevated(true))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[test]
    fn captures_exit_code_and_stderr() {
        let exec = executor(false);
        let out = exec
            .run(&CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.diagnostic(), "oops");
    }

    #[test]
    fn stdin_text_reaches_the_child() {
        let exec = executor(false);
        let out = exec
            .run(&CommandSpec::new("cat").stdin("label: dos\n"))
            .unwrap();
        assert_eq!(out.stdout, "label: dos\n");
    }

    #[test]
    fn timeout_kills_the_child() {
        let exec = executor(false);
        let spec = CommandSpec::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = exec.run(&spec).unwrap_err();
        assert!(matches!(err, ImagingError::Timeout { ref program, .. } if program == "sleep"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_grandchildren_too() {
        let exec = executor(false);
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 6 & wait"])
            .timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = exec.run(&spec).unwrap_err();
        assert_eq!(
            err,
            ImagingError::Timeout {
                program: "sh".to_string(),
                after: Duration::from_millis(200),
            }
        );
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[test]
    fn interrupt_stops_a_running_command() {
        let exec = executor(false);
        let started = std::time::Instant::now();
        let out = std::thread::scope(|scope| {
            let running = scope.spawn(|| {
                exec.run(&CommandSpec::new("sh").args(["-c", "sleep 30 & wait"]).timeout(Duration::from_secs(60)))
            });
            while exec.interrupt() == 0 {
                assert!(started.elapsed() < Duration::from_secs(5), "command never started");
                std::thread::sleep(Duration::from_millis(20));
            }
            running.join().unwrap()
        })
        .unwrap();
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(exec.interrupt(), 0);
    }

    #[test]
    fn captured_output_never_contains_the_password() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            elevation_tool: crate::testing::fake_elevation_tool(dir.path())
                .to_string_lossy()
                .into_owned(),
            ..Settings::fast()
        };
        let exec = Executor::with_privilege(&settings, false);
        exec.authenticate("hunter2-secret").unwrap();

        let out = exec
            .run(&CommandSpec::new("echo").arg("typed hunter2-secret").elevated(true))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "typed ***\n");
        assert!(out.stderr.contains("***"), "{}", out.stderr);
        assert!(!out.stderr.contains("hunter2-secret"));
        assert_eq!(exec.redact("hunter2-secret"), "***");
    }

    #[test]
    fn redaction_hides_the_secret() {
        assert_eq!(
            redact_secret("sudo: hunter2 is wrong, hunter2!", "hunter2"),
            "sudo: *** is wrong, ***!"
        );
        assert_eq!(redact_secret("nothing here", ""), "nothing here");
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::Password(Zeroizing::new("hunter2".to_string()));
        assert!(!format!("{cred:?}").contains("hunter2"));
    }

    #[test]
    fn rejected_password_clears_the_credential() {
        // `false` stands in for an elevation tool that rejects everything.
        let settings = Settings {
            elevation_tool: "false".to_string(),
            ..Settings::fast()
        };
        let exec = Executor::with_privilege(&settings, false);
        let err = exec.authenticate("wrong").unwrap_err();
        assert!(matches!(err, ImagingError::CredentialInvalid(_)));
        assert!(!exec.has_credential());
    }

    #[test]
    fn command_line_is_readable() {
        let spec = CommandSpec::new("parted").args(["-s", "/dev/sdb", "mklabel", "msdos"]);
        assert_eq!(spec.command_line(), "parted -s /dev/sdb mklabel msdos");
    }

    #[test]
    fn find_program_locates_sh() {
        assert!(find_program("sh").is_some());
        assert!(find_program("definitely-not-a-real-tool-xyz").is_none());
    }
}
