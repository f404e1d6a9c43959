// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory [`Device`] used by unit tests.

use super::CommandOutput;
use super::Device;
use super::DeviceError;
use super::DeviceProcess;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

struct Script {
    prefix: String,
    outputs: VecDeque<CommandOutput>,
}

#[derive(Default)]
struct State {
    scripts: Vec<Script>,
    files: BTreeMap<String, Vec<u8>>,
    history: Vec<String>,
    spawned: Vec<String>,
    spawn_output: String,
    spawn_exit: Option<i32>,
    killed: usize,
    guest: Option<FakeDevice>,
    disconnected: Vec<String>,
    root: bool,
    root_toggles: Vec<bool>,
    installed: Vec<String>,
    uninstalled: Vec<String>,
}

/// A scripted device. Clones share state.
#[derive(Clone)]
pub(crate) struct FakeDevice {
    serial: String,
    state: Arc<Mutex<State>>,
}

pub(crate) fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(0),
        stdout: stdout.to_owned(),
        stderr: String::new(),
    }
}

pub(crate) fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

impl FakeDevice {
    pub(crate) fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_owned(),
            state: Arc::default(),
        }
    }

    /// Answers commands starting with `prefix` with `stdout`.
    pub(crate) fn respond(&self, prefix: &str, stdout: &str) -> &Self {
        self.respond_seq(prefix, [ok(stdout)])
    }

    /// Answers successive commands starting with `prefix` with `outputs`,
    /// repeating the last one. Later scripts take precedence.
    pub(crate) fn respond_seq(
        &self,
        prefix: &str,
        outputs: impl IntoIterator<Item = CommandOutput>,
    ) -> &Self {
        self.state.lock().scripts.push(Script {
            prefix: prefix.to_owned(),
            outputs: outputs.into_iter().collect(),
        });
        self
    }

    pub(crate) fn add_file(&self, path: &str, contents: &str) -> &Self {
        self.add_file_bytes(path, contents.as_bytes())
    }

    pub(crate) fn add_file_bytes(&self, path: &str, contents: &[u8]) -> &Self {
        self.state
            .lock()
            .files
            .insert(path.to_owned(), contents.to_vec());
        self
    }

    pub(crate) fn file(&self, path: &str) -> Option<String> {
        self.file_bytes(path)
            .map(|contents| String::from_utf8_lossy(&contents).into_owned())
    }

    pub(crate) fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).cloned()
    }

    pub(crate) fn set_root(&self, root: bool) -> &Self {
        self.state.lock().root = root;
        self
    }

    pub(crate) fn set_guest(&self, guest: FakeDevice) -> &Self {
        self.state.lock().guest = Some(guest);
        self
    }

    /// Sets what spawned processes report as output and exit code.
    pub(crate) fn set_spawn_output(&self, output: &str, exit: Option<i32>) -> &Self {
        let mut state = self.state.lock();
        state.spawn_output = output.to_owned();
        state.spawn_exit = exit;
        self
    }

    pub(crate) fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    pub(crate) fn spawned(&self) -> Vec<String> {
        self.state.lock().spawned.clone()
    }

    pub(crate) fn killed(&self) -> usize {
        self.state.lock().killed
    }

    pub(crate) fn disconnected(&self) -> Vec<String> {
        self.state.lock().disconnected.clone()
    }

    pub(crate) fn root_toggles(&self) -> Vec<bool> {
        self.state.lock().root_toggles.clone()
    }

    pub(crate) fn installed(&self) -> Vec<String> {
        self.state.lock().installed.clone()
    }

    pub(crate) fn uninstalled(&self) -> Vec<String> {
        self.state.lock().uninstalled.clone()
    }
}

impl Device for FakeDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn execute(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, DeviceError> {
        let mut state = self.state.lock();
        state.history.push(command.to_owned());
        if let Some(script) = state
            .scripts
            .iter_mut()
            .rev()
            .find(|script| command.starts_with(&script.prefix))
        {
            let output = if script.outputs.len() > 1 {
                script.outputs.pop_front()
            } else {
                script.outputs.front().cloned()
            };
            return Ok(output.unwrap_or_default());
        }
        if let Some(path) = command.strip_prefix("cat ") {
            return Ok(match state.files.get(path) {
                Some(contents) => ok(&String::from_utf8_lossy(contents)),
                None => failed(1, "No such file or directory"),
            });
        }
        if let Some(path) = command.strip_prefix("test -e ") {
            return Ok(if state.files.contains_key(path) {
                ok("")
            } else {
                failed(1, "")
            });
        }
        if command == "id -u" {
            return Ok(ok(if state.root { "0\n" } else { "2000\n" }));
        }
        Ok(failed(127, &format!("unscripted command: {command}")))
    }

    fn pull_file(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        let contents = self
            .file_bytes(remote)
            .ok_or_else(|| DeviceError::Unavailable(format!("no such file {remote}")))?;
        fs_err::write(local, contents).map_err(|source| DeviceError::Launch {
            program: "fake pull".into(),
            source,
        })
    }

    fn pull_dir(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        let prefix = format!("{}/", remote.trim_end_matches('/'));
        let files: Vec<_> = self
            .state
            .lock()
            .files
            .iter()
            .filter_map(|(path, contents)| {
                Some((path.strip_prefix(&prefix)?.to_owned(), contents.clone()))
            })
            .collect();
        for (relative, contents) in files {
            let path = local.join(relative);
            let io = |source| DeviceError::Launch {
                program: "fake pull".into(),
                source,
            };
            if let Some(parent) = path.parent() {
                fs_err::create_dir_all(parent).map_err(io)?;
            }
            fs_err::write(&path, contents).map_err(io)?;
        }
        Ok(())
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let contents = fs_err::read(local).map_err(|source| DeviceError::Launch {
            program: "fake push".into(),
            source,
        })?;
        self.add_file_bytes(remote, &contents);
        Ok(())
    }

    fn push_dir(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        self.state
            .lock()
            .history
            .push(format!("push_dir {} {remote}", local.display()));
        Ok(())
    }

    fn spawn(&self, command: &str) -> Result<Box<dyn DeviceProcess>, DeviceError> {
        let mut state = self.state.lock();
        state.spawned.push(command.to_owned());
        Ok(Box::new(FakeProcess {
            device: self.clone(),
            output: state.spawn_output.clone(),
            exit: state.spawn_exit,
        }))
    }

    fn connect_guest(&self, cid: u32) -> Result<Box<dyn Device>, DeviceError> {
        match self.state.lock().guest.clone() {
            Some(guest) => Ok(Box::new(guest)),
            None => Err(DeviceError::Unavailable(format!(
                "no guest with cid {cid}"
            ))),
        }
    }

    fn disconnect_guest(&self, guest_serial: &str) -> Result<(), DeviceError> {
        self.state
            .lock()
            .disconnected
            .push(guest_serial.to_owned());
        Ok(())
    }

    fn enable_root(&self) -> Result<bool, DeviceError> {
        let mut state = self.state.lock();
        state.root = true;
        state.root_toggles.push(true);
        Ok(true)
    }

    fn disable_root(&self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.root = false;
        state.root_toggles.push(false);
        Ok(())
    }

    fn install_package(&self, apk: &Path, _reinstall: bool) -> Result<(), DeviceError> {
        self.state
            .lock()
            .installed
            .push(apk.display().to_string());
        Ok(())
    }

    fn uninstall_package(&self, package: &str) -> Result<(), DeviceError> {
        self.state.lock().uninstalled.push(package.to_owned());
        Ok(())
    }
}

struct FakeProcess {
    device: FakeDevice,
    output: String,
    exit: Option<i32>,
}

impl DeviceProcess for FakeProcess {
    fn output(&self) -> String {
        self.output.clone()
    }

    fn try_wait(&mut self) -> Result<Option<i32>, DeviceError> {
        Ok(self.exit)
    }

    fn kill(&mut self) -> Result<(), DeviceError> {
        if self.exit.is_none() {
            self.device.state.lock().killed += 1;
            self.exit = Some(-1);
        }
        Ok(())
    }
}
