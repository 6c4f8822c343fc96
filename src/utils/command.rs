//! Command execution primitives with consistent error handling.
//!
//! Every external tool is invoked with an explicit argument list (never a shell
//! string), an optional deadline, and interrupt polling.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{CommandFailedDetails, Error, Result};
use crate::interrupt;
use crate::utils::shell;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHUNK_SIZE: usize = 64 * 1024;

/// A fully specified subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Keep running after an interrupt (cleanup commands). The deadline still applies.
    pub cleanup: bool,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        self
    }

    /// Mark as teardown work that must still run once an interrupt has arrived.
    pub fn cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.cleanup {
            return Ok(());
        }
        interrupt::check(&self.program)
    }

    /// Quoted command line for logs. Environment values are never included.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell::quote_args(&parts)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        self.command()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::tooling_unavailable(vec![self.program.clone()])
                } else {
                    Error::internal_io(e.to_string(), Some(format!("spawn {}", self.program)))
                }
            })
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessOutput {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl ProcessOutput {
    /// Prefers stderr, falls back to stdout if stderr is empty.
    pub fn error_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else {
            self.stdout.trim().to_string()
        }
    }

    /// Convert a non-zero exit into `process.command_failed`.
    pub fn require_success(self, spec: &ProcessSpec) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        Err(Error::command_failed(self.failure_details(spec)))
    }

    pub fn failure_details(&self, spec: &ProcessSpec) -> CommandFailedDetails {
        CommandFailedDetails {
            command: spec.display(),
            exit_code: self.exit_code,
            stdout: tail(&self.stdout),
            stderr: tail(&self.stderr),
        }
    }
}

fn tail(text: &str) -> String {
    const MAX: usize = 4000;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut start = text.len() - MAX;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn deadline_for(spec: &ProcessSpec) -> Option<Instant> {
    spec.timeout.map(|t| Instant::now() + t)
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Fail (after killing the child) if the deadline passed or an interrupt arrived.
fn check_limits(child: &mut Child, spec: &ProcessSpec, deadline: Option<Instant>) -> Result<()> {
    if !spec.cleanup && interrupt::is_interrupted() {
        kill(child);
        return Err(Error::interrupted(&spec.program));
    }
    if deadline.is_some_and(|d| Instant::now() >= d) {
        kill(child);
        let secs = spec.timeout.map(|t| t.as_secs()).unwrap_or(0);
        return Err(Error::process_timeout(&spec.display(), secs));
    }
    Ok(())
}

fn wait_bounded(child: &mut Child, spec: &ProcessSpec, deadline: Option<Instant>) -> Result<i32> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code().unwrap_or(-1)),
            Ok(None) => {
                check_limits(child, spec, deadline)?;
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                kill(child);
                return Err(Error::internal_io(
                    e.to_string(),
                    Some(format!("wait {}", spec.program)),
                ));
            }
        }
    }
}

fn finish(
    exit_code: i32,
    stdout: thread::JoinHandle<String>,
    stderr: thread::JoinHandle<String>,
) -> ProcessOutput {
    ProcessOutput {
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
        exit_code,
        success: exit_code == 0,
    }
}

/// Run to completion, capturing stdout and stderr.
pub fn execute(spec: &ProcessSpec) -> Result<ProcessOutput> {
    spec.check_interrupt()?;
    let deadline = deadline_for(spec);
    let mut child = spec.spawn(Stdio::null(), Stdio::piped())?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let exit_code = wait_bounded(&mut child, spec, deadline)?;
    Ok(finish(exit_code, stdout, stderr))
}

/// Run to completion and fail on a non-zero exit.
pub fn execute_checked(spec: &ProcessSpec) -> Result<ProcessOutput> {
    execute(spec)?.require_success(spec)
}

/// Run with stdout streamed into `sink` (a dump feeding a compressor, for example).
///
/// The returned output has an empty `stdout`; stderr is captured.
pub fn execute_to_writer(spec: &ProcessSpec, sink: &mut dyn Write) -> Result<ProcessOutput> {
    spec.check_interrupt()?;
    let deadline = deadline_for(spec);
    let mut child = spec.spawn(Stdio::null(), Stdio::piped())?;
    let stderr = drain(child.stderr.take());

    let (tx, rx) = mpsc::channel::<std::io::Result<Vec<u8>>>();
    let mut stdout = child.stdout.take();
    let reader = thread::spawn(move || {
        let Some(out) = stdout.as_mut() else {
            return;
        };
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            match out.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }
    });

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(chunk)) => {
                if let Err(e) = sink.write_all(&chunk) {
                    kill(&mut child);
                    return Err(Error::internal_io(
                        e.to_string(),
                        Some(format!("write {} output", spec.program)),
                    ));
                }
            }
            Ok(Err(e)) => {
                kill(&mut child);
                return Err(Error::internal_io(
                    e.to_string(),
                    Some(format!("read {} output", spec.program)),
                ));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => check_limits(&mut child, spec, deadline)?,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = reader.join();

    let exit_code = wait_bounded(&mut child, spec, deadline)?;
    Ok(ProcessOutput {
        stdout: String::new(),
        stderr: stderr.join().unwrap_or_default(),
        exit_code,
        success: exit_code == 0,
    })
}

/// Run with `source` streamed into the child's stdin (a restore fed by a decoder).
pub fn execute_with_stdin(spec: &ProcessSpec, source: &mut dyn Read) -> Result<ProcessOutput> {
    spec.check_interrupt()?;
    let deadline = deadline_for(spec);
    let mut child = spec.spawn(Stdio::piped(), Stdio::piped())?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    if let Some(mut stdin) = child.stdin.take() {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            check_limits(&mut child, spec, deadline)?;
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    kill(&mut child);
                    return Err(Error::internal_io(
                        e.to_string(),
                        Some(format!("read input for {}", spec.program)),
                    ));
                }
            };
            if stdin.write_all(&buf[..n]).is_err() {
                // Child closed stdin early; its exit status reports why.
                break;
            }
        }
    }

    let exit_code = wait_bounded(&mut child, spec, deadline)?;
    Ok(finish(exit_code, stdout, stderr))
}

/// A running child fed incrementally through its stdin, for producers that
/// push bytes (a gzip encoder writing into `gpg`) rather than hand over a reader.
///
/// Dropping an unfinished sink kills the child.
pub struct StdinSink {
    spec: ProcessSpec,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<thread::JoinHandle<String>>,
    stderr: Option<thread::JoinHandle<String>>,
    deadline: Option<Instant>,
}

pub fn spawn_with_stdin(spec: &ProcessSpec) -> Result<StdinSink> {
    spec.check_interrupt()?;
    let deadline = deadline_for(spec);
    let mut child = spec.spawn(Stdio::piped(), Stdio::piped())?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let stdin = child.stdin.take();
    Ok(StdinSink {
        spec: spec.clone(),
        child: Some(child),
        stdin,
        stdout: Some(stdout),
        stderr: Some(stderr),
        deadline,
    })
}

impl StdinSink {
    /// Close stdin, wait for the child within its deadline and require a zero exit.
    pub fn finish(mut self) -> Result<ProcessOutput> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Err(Error::internal_unexpected(format!("{} already finished", self.spec.program)));
        };
        let exit_code = wait_bounded(&mut child, &self.spec, self.deadline)?;
        let output = match (self.stdout.take(), self.stderr.take()) {
            (Some(stdout), Some(stderr)) => finish(exit_code, stdout, stderr),
            _ => ProcessOutput {
                exit_code,
                success: exit_code == 0,
                ..ProcessOutput::default()
            },
        };
        output.require_success(&self.spec)
    }
}

impl Write for StdinSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write(buf),
            None => Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for StdinSink {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            kill(&mut child);
        }
    }
}

/// Locate an executable on PATH.
pub fn which(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let full = dir.join(program);
        if full.is_file() {
            return Some(full);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{}.exe", program));
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

/// Fail with `tooling.unavailable` naming every missing tool.
pub fn require_tools(programs: &[&str]) -> Result<()> {
    let missing: Vec<String> = programs
        .iter()
        .filter(|p| which(p).is_none())
        .map(|p| p.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::tooling_unavailable(missing))
    }
}

/// Run a command in a specific directory.
///
/// Returns trimmed stdout if the command succeeds.
/// Returns an error with stderr (or stdout fallback) if it fails.
pub fn run_in(dir: &Path, program: &str, args: &[&str], context: &str) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| {
            Error::internal_io(
                format!("Failed to run {}: {}", context, e),
                Some(context.to_string()),
            )
        })?;

    if !output.status.success() {
        return Err(Error::internal_io(
            format!("{} failed: {}", context, error_text(&output)),
            Some(context.to_string()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Extract error text from command output.
///
/// Prefers stderr, falls back to stdout if stderr is empty.
pub fn error_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }
}
