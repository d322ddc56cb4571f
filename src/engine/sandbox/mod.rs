mod docker;
#[cfg(test)]
pub mod fake;

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::engine::{limits::ResourceConstraints, verdict::killed_by_limit_signal};

pub use docker::DockerSandbox;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox image not found: {0}")]
    ImageNotFound(String),
    #[error("timed out waiting for sandbox to exit")]
    WaitTimeout,
    #[error("sandbox backend {op} failed: {message}")]
    Backend { op: &'static str, message: String },
}

impl SandboxError {
    pub fn backend(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Backend {
            op,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMount {
    pub host_dir: PathBuf,
    pub target: String,
}

/// Everything needed to create one single-use sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub name: String,
    pub command: Vec<String>,
    pub working_volume: String,
    pub working_dir: String,
    pub data_mount: Option<DataMount>,
    pub constraints: ResourceConstraints,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct SandboxState {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub oom_killed: bool,
}

impl SandboxState {
    /// Wall-clock seconds between start and finish. Negative spans, seen
    /// under clock skew, are reported as unknown.
    pub fn duration_secs(&self) -> Option<f64> {
        let (started, finished) = (self.started_at?, self.finished_at?);
        let millis = (finished - started).num_milliseconds();
        if millis < 0 {
            return None;
        }
        Some(millis as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Raw facts about one sandbox run. Interpretation belongs to the verdict engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_secs: Option<f64>,
    pub timed_out: bool,
    pub oom_killed: bool,
}

impl ExecutionResult {
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_secs.map(|secs| (secs * 1000.0).round() as u64)
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{} |-| {}", self.stdout, self.stderr)
        }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_volume(&self, name: &str) -> Result<(), SandboxError>;

    /// Removing a volume that no longer exists succeeds.
    async fn remove_volume(&self, name: &str) -> Result<(), SandboxError>;

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Blocks until the sandbox exits and returns its exit status. Must give up
    /// with [`SandboxError::WaitTimeout`] once `deadline` elapses.
    async fn wait(&self, handle: &SandboxHandle, deadline: Duration) -> Result<i64, SandboxError>;

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, SandboxError>;

    async fn logs(&self, handle: &SandboxHandle) -> Result<CapturedOutput, SandboxError>;

    /// Forced removal; removing an already removed sandbox succeeds.
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    async fn put_archive(
        &self,
        handle: &SandboxHandle,
        path: &str,
        archive: Bytes,
    ) -> Result<(), SandboxError>;

    /// `Ok(None)` when `path` does not exist inside the sandbox.
    async fn get_archive(
        &self,
        handle: &SandboxHandle,
        path: &str,
    ) -> Result<Option<Bytes>, SandboxError>;
}

#[derive(Debug, Clone)]
pub struct ArchiveUpload {
    pub path: String,
    pub archive: Bytes,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub spec: SandboxSpec,
    pub upload: Option<ArchiveUpload>,
    pub collect: Option<String>,
}

impl SandboxRequest {
    pub fn new(spec: SandboxSpec) -> Self {
        Self {
            spec,
            upload: None,
            collect: None,
        }
    }

    pub fn with_upload(mut self, path: impl Into<String>, archive: Bytes) -> Self {
        self.upload = Some(ArchiveUpload {
            path: path.into(),
            archive,
        });
        self
    }

    pub fn collecting(mut self, path: impl Into<String>) -> Self {
        self.collect = Some(path.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub result: ExecutionResult,
    pub collected: Option<Bytes>,
}

#[derive(Clone)]
pub struct SandboxController {
    backend: Arc<dyn SandboxBackend>,
}

impl SandboxController {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    pub async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let handle = self.backend.create(spec).await?;
        tracing::debug!(sandbox = %handle.name, command = ?spec.command, "sandbox created");
        Ok(handle)
    }

    pub async fn run(
        &self,
        handle: &SandboxHandle,
        deadline: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        self.backend.start(handle).await?;

        let mut result = ExecutionResult::default();
        match self.backend.wait(handle, deadline).await {
            Ok(code) => result.exit_code = Some(code),
            Err(SandboxError::WaitTimeout) => {
                tracing::debug!(sandbox = %handle.name, ?deadline, "real time deadline elapsed");
                result.timed_out = true;
                return Ok(result);
            }
            Err(err) => return Err(err),
        }

        match self.backend.logs(handle).await {
            Ok(output) => {
                result.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                result.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            }
            Err(err) => {
                tracing::warn!(sandbox = %handle.name, error = %err, "failed to collect sandbox output");
            }
        }

        let state = self.backend.inspect(handle).await?;
        result.duration_secs = state.duration_secs();
        result.oom_killed = state.oom_killed;

        if let Some(code) = result.exit_code {
            if killed_by_limit_signal(code) && !state.oom_killed {
                result.timed_out = true;
            }
        }

        Ok(result)
    }

    pub async fn destroy(&self, handle: &SandboxHandle) {
        match self.backend.remove(handle).await {
            Ok(()) => tracing::debug!(sandbox = %handle.name, "sandbox removed"),
            Err(err) => {
                tracing::warn!(sandbox = %handle.name, error = %err, "failed to remove sandbox")
            }
        }
    }

    /// Creates a sandbox, optionally uploads an archive, runs it to completion,
    /// optionally collects a file, and removes the sandbox on every path.
    pub async fn execute(&self, request: SandboxRequest) -> Result<SandboxRun, SandboxError> {
        let handle = self.create(&request.spec).await?;
        let outcome = self.execute_in(&handle, &request).await;
        self.destroy(&handle).await;
        outcome
    }

    async fn execute_in(
        &self,
        handle: &SandboxHandle,
        request: &SandboxRequest,
    ) -> Result<SandboxRun, SandboxError> {
        if let Some(upload) = &request.upload {
            self.backend
                .put_archive(handle, &upload.path, upload.archive.clone())
                .await?;
        }

        let result = self.run(handle, request.spec.constraints.real_time).await?;

        let collected = match &request.collect {
            Some(path) if result.exit_code.is_some() => {
                self.backend.get_archive(handle, path).await?
            }
            _ => None,
        };

        Ok(SandboxRun { result, collected })
    }
}
