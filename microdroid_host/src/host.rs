// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Running processes on the host with bounded timeouts.

use parking_lot::Mutex;
use std::ffi::OsStr;
use std::io::Read;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

const WAIT_INTERVAL: Duration = Duration::from_millis(50);

/// Returns a command for `program` with `LD_LIBRARY_PATH` cleared.
///
/// CI containers sometimes point `LD_LIBRARY_PATH` at an older libc++, which
/// overrides the `DT_RUNPATH` the prebuilt tools rely on.
pub fn host_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_remove("LD_LIBRARY_PATH");
    cmd
}

/// How a timed command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedStatus {
    /// The process exited on its own.
    Exited(ExitStatus),
    /// The process was killed after exceeding its timeout.
    TimedOut(Duration),
}

impl TimedStatus {
    /// Returns true if the process exited with status zero.
    pub fn success(&self) -> bool {
        matches!(self, TimedStatus::Exited(status) if status.success())
    }
}

impl std::fmt::Display for TimedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimedStatus::Exited(status) => write!(f, "{status}"),
            TimedStatus::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
        }
    }
}

/// The captured result of [`run_timed`].
#[derive(Debug, Clone)]
pub struct TimedOutput {
    /// How the process finished.
    pub status: TimedStatus,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Runs `cmd` to completion, killing it if it outlives `timeout`.
pub fn run_timed(cmd: &mut Command, timeout: Duration) -> std::io::Result<TimedOutput> {
    let mut process = HostProcess::spawn(cmd)?;
    let start = Instant::now();
    let status = loop {
        if let Some(status) = process.child.try_wait()? {
            break TimedStatus::Exited(status);
        }
        if start.elapsed() >= timeout {
            tracing::warn!(
                program = %cmd.get_program().to_string_lossy(),
                ?timeout,
                "host command timed out, killing it"
            );
            process.kill()?;
            break TimedStatus::TimedOut(timeout);
        }
        std::thread::sleep(WAIT_INTERVAL);
    };
    // Grandchildren of a killed process can keep the pipes open, so only wait
    // for the readers to hit EOF when the process exited on its own.
    let (stdout, stderr) = process.into_output(matches!(status, TimedStatus::Exited(_)))?;
    tracing::debug!(
        program = %cmd.get_program().to_string_lossy(),
        %status,
        stdout,
        stderr
    );
    Ok(TimedOutput {
        status,
        stdout,
        stderr,
    })
}

/// A host process whose output is drained into memory by reader threads.
pub struct HostProcess {
    child: Child,
    stdout: Arc<Mutex<String>>,
    stderr: Arc<Mutex<String>>,
    readers: Vec<JoinHandle<()>>,
}

impl HostProcess {
    /// Spawns `cmd` with piped stdout and stderr and null stdin.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));
        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(drain(pipe, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(drain(pipe, stderr.clone()));
        }
        Ok(Self {
            child,
            stdout,
            stderr,
            readers,
        })
    }

    /// Returns everything written to stdout and stderr so far.
    pub fn output(&self) -> String {
        let mut output = self.stdout.lock().clone();
        output.push_str(&self.stderr.lock());
        output
    }

    /// Returns the exit status if the process has exited.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kills the process if it is still running and reaps it.
    pub fn kill(&mut self) -> std::io::Result<()> {
        if self.child.try_wait()?.is_none() {
            // The process may exit between the check and the kill.
            match self.child.kill() {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(err) => return Err(err),
            }
            self.child.wait()?;
        }
        Ok(())
    }

    fn into_output(mut self, wait_for_readers: bool) -> std::io::Result<(String, String)> {
        if wait_for_readers {
            join_readers(self.readers.drain(..))?;
        }
        let stdout = std::mem::take(&mut *self.stdout.lock());
        let stderr = std::mem::take(&mut *self.stderr.lock());
        Ok((stdout, stderr))
    }
}

/// Waits for every reader, failing if one of them panicked.
fn join_readers(readers: impl IntoIterator<Item = JoinHandle<()>>) -> std::io::Result<()> {
    let mut panicked = 0;
    for reader in readers {
        if reader.join().is_err() {
            panicked += 1;
        }
    }
    if panicked > 0 {
        return Err(std::io::Error::other(format!(
            "{panicked} output reader thread(s) panicked"
        )));
    }
    Ok(())
}

fn drain(mut pipe: impl Read + Send + 'static, sink: Arc<Mutex<String>>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().push_str(&String::from_utf8_lossy(&buf[..n])),
            }
        }
    })
}
