//! A scripted [`CommandRunner`] for unit tests.

use crate::error::{ImagingError, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Response {
    prefix: String,
    output: Result<CommandOutput>,
    once: bool,
    /// Hold the call until [`CommandRunner::interrupt`] is called.
    blocks: bool,
}

/// Answers `run` from a table keyed by command-line prefix and records every
/// call. Unmatched commands succeed with empty output. `spawn` runs a shell
/// script with the command's arguments as `$@`.
pub struct ScriptedRunner {
    responses: Mutex<Vec<Response>>,
    calls: Mutex<Vec<CommandSpec>>,
    spawn_script: Mutex<String>,
    privileged: bool,
    interrupted: AtomicBool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            spawn_script: Mutex::new("exit 0".to_string()),
            privileged: true,
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    fn push(&self, prefix: &str, code: i32, stdout: &str, stderr: &str, once: bool) {
        self.push_result(
            prefix,
            Ok(CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
            once,
            false,
        );
    }

    fn push_result(&self, prefix: &str, output: Result<CommandOutput>, once: bool, blocks: bool) {
        self.responses.lock().unwrap().push(Response {
            prefix: prefix.to_string(),
            output,
            once,
            blocks,
        });
    }

    pub fn respond(self, prefix: &str, code: i32, stdout: &str) -> Self {
        self.push(prefix, code, stdout, "", false);
        self
    }

    pub fn fail(self, prefix: &str, stderr: &str) -> Self {
        self.push(prefix, 1, "", stderr, false);
        self
    }

    /// A response consumed by the first matching call.
    pub fn respond_once(self, prefix: &str, code: i32, stdout: &str) -> Self {
        self.push(prefix, code, stdout, "", true);
        self
    }

    /// `run` returns `err` instead of an exit status.
    pub fn error(self, prefix: &str, err: ImagingError) -> Self {
        self.push_result(prefix, Err(err), false, false);
        self
    }

    /// `run` waits until interrupted, then reports death by SIGTERM.
    pub fn block(self, prefix: &str) -> Self {
        let killed = CommandOutput { code: None, ..CommandOutput::default() };
        self.push_result(prefix, Ok(killed), false, true);
        self
    }

    pub fn spawning(self, script: &str) -> Self {
        *self.spawn_script.lock().unwrap() = script.to_string();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let line = spec.command_line();
        let mut responses = self.responses.lock().unwrap();
        let Some(index) = responses.iter().position(|r| line.starts_with(&r.prefix)) else {
            return Ok(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            });
        };
        let output = responses[index].output.clone();
        let blocks = responses[index].blocks;
        if responses[index].once {
            responses.remove(index);
        }
        drop(responses);
        if blocks {
            while !self.interrupted.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        output
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<Child> {
        self.calls.lock().unwrap().push(spec.clone());
        let script = self.spawn_script.lock().unwrap().clone();
        Ok(Command::new("sh")
            .arg("-c")
            .arg(script)
            .arg(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?)
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn interrupt(&self) -> usize {
        self.interrupted.store(true, Ordering::SeqCst);
        1
    }
}

/// Writes a stand-in for `sudo` into `dir`: it reads the password line, echoes
/// it to stderr the way a chatty tool might, then runs the command after `--`.
pub fn fake_elevation_tool(dir: &Path) -> PathBuf {
    let path = dir.join("fake-sudo");
    std::fs::write(
        &path,
        "#!/bin/sh\nread -r pw\necho \"checked $pw\" >&2\n\
         while [ \"$#\" -gt 0 ] && [ \"$1\" != \"--\" ]; do shift; done\n\
         shift\nexec \"$@\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
