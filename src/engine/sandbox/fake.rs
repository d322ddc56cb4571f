//! Scripted in-memory backend for tests. Sandboxes pick their behaviour from
//! the first rule whose pattern occurs in their command line, and every
//! sandbox and volume is accounted for so tests can assert cleanup.

use std::{
    collections::BTreeMap,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeDelta, Utc};

use crate::engine::{
    artifact::pack_file,
    sandbox::{
        CapturedOutput, SandboxBackend, SandboxError, SandboxHandle, SandboxSpec, SandboxState,
    },
};

const DEFAULT_PEAK_MEMORY_KB: u64 = 1024;

#[derive(Debug, Clone)]
enum FakeExit {
    Code(i64),
    Timeout,
    WaitError,
}

#[derive(Debug, Clone)]
pub struct FakeOutcome {
    exit: FakeExit,
    stdout: String,
    stderr: String,
    oom_killed: bool,
    duration_ms: i64,
    output: Option<String>,
    inspect_fails: bool,
}

impl FakeOutcome {
    pub fn exit(code: i64) -> Self {
        Self {
            exit: FakeExit::Code(code),
            stdout: String::new(),
            stderr: String::new(),
            oom_killed: false,
            duration_ms: 10,
            output: None,
            inspect_fails: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            exit: FakeExit::Timeout,
            ..Self::exit(0)
        }
    }

    pub fn wait_error() -> Self {
        Self {
            exit: FakeExit::WaitError,
            ..Self::exit(0)
        }
    }

    pub fn stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn stderr(mut self, stderr: &str) -> Self {
        self.stderr = stderr.to_string();
        self
    }

    pub fn oom(mut self) -> Self {
        self.oom_killed = true;
        self
    }

    pub fn duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Content of the file the program leaves behind for `get_archive`.
    pub fn output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }

    pub fn inspect_fails(mut self) -> Self {
        self.inspect_fails = true;
        self
    }

    fn default_for(command: &str) -> Self {
        if command.contains("/usr/bin/time") {
            Self::exit(0).stdout(&format!(
                "\tMaximum resident set size (kbytes): {DEFAULT_PEAK_MEMORY_KB}\n"
            ))
        } else {
            Self::exit(0)
        }
    }
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    live: BTreeMap<String, FakeOutcome>,
    created: Vec<SandboxSpec>,
    removed: Vec<String>,
    uploads: Vec<(String, String)>,
    volumes_created: Vec<String>,
    volumes_removed: Vec<String>,
}

#[derive(Default)]
pub struct FakeBackend {
    rules: Vec<(String, FakeOutcome)>,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, pattern: &str, outcome: FakeOutcome) -> Self {
        self.rules.push((pattern.to_string(), outcome));
        self
    }

    pub fn created_sandboxes(&self) -> Vec<SandboxSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn live_sandboxes(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn live_volumes(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .volumes_created
            .iter()
            .filter(|name| !state.volumes_removed.contains(name))
            .count()
    }

    /// Commands of every sandbox created, in creation order.
    pub fn commands(&self) -> Vec<String> {
        self.created_sandboxes()
            .iter()
            .map(|spec| spec.command.join(" "))
            .collect()
    }

    fn outcome(&self, handle: &SandboxHandle) -> Result<FakeOutcome, SandboxError> {
        self.state
            .lock()
            .unwrap()
            .live
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SandboxError::backend("lookup", format!("no such sandbox {}", handle.id)))
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_volume(&self, name: &str) -> Result<(), SandboxError> {
        self.state.lock().unwrap().volumes_created.push(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), SandboxError> {
        self.state.lock().unwrap().volumes_removed.push(name.to_string());
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let command = spec.command.join(" ");
        let outcome = self
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or_else(|| FakeOutcome::default_for(&command));

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.live.insert(id.clone(), outcome);
        state.created.push(spec.clone());
        Ok(SandboxHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.outcome(handle).map(|_| ())
    }

    async fn wait(&self, handle: &SandboxHandle, _deadline: Duration) -> Result<i64, SandboxError> {
        match self.outcome(handle)?.exit {
            FakeExit::Code(code) => Ok(code),
            FakeExit::Timeout => Err(SandboxError::WaitTimeout),
            FakeExit::WaitError => Err(SandboxError::backend("wait", "connection reset")),
        }
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, SandboxError> {
        let outcome = self.outcome(handle)?;
        if outcome.inspect_fails {
            return Err(SandboxError::backend("inspect", "daemon went away"));
        }
        let started = Utc::now();
        Ok(SandboxState {
            started_at: Some(started),
            finished_at: Some(started + TimeDelta::milliseconds(outcome.duration_ms)),
            oom_killed: outcome.oom_killed,
        })
    }

    async fn logs(&self, handle: &SandboxHandle) -> Result<CapturedOutput, SandboxError> {
        let outcome = self.outcome(handle)?;
        Ok(CapturedOutput {
            stdout: outcome.stdout.into_bytes(),
            stderr: outcome.stderr.into_bytes(),
        })
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut state = self.state.lock().unwrap();
        state.live.remove(&handle.id);
        state.removed.push(handle.id.clone());
        Ok(())
    }

    async fn put_archive(
        &self,
        handle: &SandboxHandle,
        path: &str,
        _archive: Bytes,
    ) -> Result<(), SandboxError> {
        self.outcome(handle)?;
        self.state
            .lock()
            .unwrap()
            .uploads
            .push((handle.name.clone(), path.to_string()));
        Ok(())
    }

    async fn get_archive(
        &self,
        handle: &SandboxHandle,
        path: &str,
    ) -> Result<Option<Bytes>, SandboxError> {
        let Some(output) = self.outcome(handle)?.output else {
            return Ok(None);
        };
        let name = path.rsplit('/').next().unwrap_or(path);
        pack_file(name, output.as_bytes())
            .map(Some)
            .map_err(|err| SandboxError::backend("get archive", err))
    }
}
