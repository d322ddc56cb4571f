use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        UploadToContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    models::{ContainerWaitResponse, HostConfig, ResourcesUlimits},
    volume::{CreateVolumeOptions, RemoveVolumeOptions},
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::time::error::Elapsed;

use crate::engine::sandbox::{
    CapturedOutput, SandboxBackend, SandboxError, SandboxHandle, SandboxSpec, SandboxState,
};

pub struct DockerSandbox {
    docker: Docker,
    image: String,
}

impl DockerSandbox {
    pub fn connect(image: impl Into<String>, timeout: Duration) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| SandboxError::backend("connect", err))?
            .with_timeout(timeout);
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    /// Fails fast at startup instead of on the first submission.
    pub async fn ensure_image(&self) -> Result<(), SandboxError> {
        match self.docker.inspect_image(&self.image).await {
            Ok(_) => Ok(()),
            Err(err) if has_status(&err, 404) => Err(SandboxError::ImageNotFound(self.image.clone())),
            Err(err) => Err(SandboxError::backend("inspect image", err)),
        }
    }

    fn container_config(&self, spec: &SandboxSpec) -> Config<String> {
        Config {
            image: Some(self.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            network_disabled: Some(true),
            host_config: Some(host_config(spec)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create_volume(&self, name: &str) -> Result<(), SandboxError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|err| SandboxError::backend("create volume", err))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), SandboxError> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if has_status(&err, 404) => {
                tracing::warn!(volume = name, "volume already gone");
                Ok(())
            }
            Err(err) => Err(SandboxError::backend("remove volume", err)),
        }
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        match self
            .docker
            .create_container(Some(options), self.container_config(spec))
            .await
        {
            Ok(created) => Ok(SandboxHandle {
                id: created.id,
                name: spec.name.clone(),
            }),
            Err(err) if has_status(&err, 404) => {
                tracing::error!(image = %self.image, "sandbox image not found");
                Err(SandboxError::ImageNotFound(self.image.clone()))
            }
            Err(err) => Err(SandboxError::backend("create container", err)),
        }
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| SandboxError::backend("start container", err))
    }

    async fn wait(&self, handle: &SandboxHandle, deadline: Duration) -> Result<i64, SandboxError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = Box::pin(self.docker.wait_container(&handle.id, Some(options)));
        wait_outcome(tokio::time::timeout(deadline, stream.next()).await)
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, SandboxError> {
        let info = self
            .docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| SandboxError::backend("inspect", err))?;
        let state = info.state.unwrap_or_default();

        Ok(SandboxState {
            started_at: state.started_at.as_deref().and_then(parse_timestamp),
            finished_at: state.finished_at.as_deref().and_then(parse_timestamp),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn logs(&self, handle: &SandboxHandle) -> Result<CapturedOutput, SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.logs(&handle.id, Some(options)));
        let mut output = CapturedOutput::default();

        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|err| SandboxError::backend("logs", err))? {
                LogOutput::StdOut { message } => output.stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => output.stderr.extend_from_slice(&message),
                _ => {}
            }
        }
        Ok(output)
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(err) if has_status(&err, 404) => Ok(()),
            Err(err) => Err(SandboxError::backend("remove container", err)),
        }
    }

    async fn put_archive(
        &self,
        handle: &SandboxHandle,
        path: &str,
        archive: Bytes,
    ) -> Result<(), SandboxError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(&handle.id, Some(options), archive)
            .await
            .map_err(|err| SandboxError::backend("put archive", err))
    }

    async fn get_archive(
        &self,
        handle: &SandboxHandle,
        path: &str,
    ) -> Result<Option<Bytes>, SandboxError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = Box::pin(self.docker.download_from_container(&handle.id, Some(options)));
        let mut archive = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(err) if has_status(&err, 404) => return Ok(None),
                Err(err) => return Err(SandboxError::backend("get archive", err)),
            }
        }
        Ok(Some(archive.freeze()))
    }
}

fn host_config(spec: &SandboxSpec) -> HostConfig {
    let mut binds = vec![format!("{}:{}:rw", spec.working_volume, spec.working_dir)];
    if let Some(mount) = &spec.data_mount {
        binds.push(format!("{}:{}:ro", mount.host_dir.display(), mount.target));
    }

    let ulimits = spec
        .constraints
        .ulimits
        .iter()
        .map(|limit| ResourcesUlimits {
            name: Some(limit.name.to_string()),
            soft: Some(limit.soft),
            hard: Some(limit.hard),
        })
        .collect();

    HostConfig {
        binds: Some(binds),
        memory: Some(spec.constraints.memory_bytes),
        memory_swap: Some(spec.constraints.memory_swap_bytes),
        ulimits: Some(ulimits),
        ..Default::default()
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn has_status(err: &DockerError, status: u16) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}

/// Folds a bounded wait into an exit code. Both our deadline and the client's
/// read timeout mean the sandbox overran.
fn wait_outcome(
    waited: Result<Option<Result<ContainerWaitResponse, DockerError>>, Elapsed>,
) -> Result<i64, SandboxError> {
    match waited {
        Err(_elapsed) => Err(SandboxError::WaitTimeout),
        Ok(Some(Ok(response))) => Ok(response.status_code),
        // bollard reports a non-zero exit status as an error
        Ok(Some(Err(DockerError::DockerContainerWaitError { code, .. }))) => Ok(code),
        Ok(Some(Err(DockerError::RequestTimeoutError))) => Err(SandboxError::WaitTimeout),
        Ok(Some(Err(err))) => Err(SandboxError::backend("wait container", err)),
        Ok(None) => Err(SandboxError::backend(
            "wait container",
            "wait stream closed without a status",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::engine::{
        limits::{LimitDefaults, Limits, translate},
        sandbox::DataMount,
    };

    fn spec(data_mount: Option<DataMount>) -> SandboxSpec {
        SandboxSpec {
            name: "job-run-1".to_string(),
            command: vec!["/bin/bash".into(), "-c".into(), "./main".into()],
            working_volume: "judge-abc".to_string(),
            working_dir: "/judgebox".to_string(),
            data_mount,
            constraints: translate(&Limits::new(2, 64, 4096), &LimitDefaults::default()),
        }
    }

    #[test]
    fn host_config_binds_volume_and_read_only_data() {
        let config = host_config(&spec(Some(DataMount {
            host_dir: PathBuf::from("/srv/test_data/7"),
            target: "/data".to_string(),
        })));

        assert_eq!(
            config.binds.unwrap(),
            vec![
                "judge-abc:/judgebox:rw".to_string(),
                "/srv/test_data/7:/data:ro".to_string()
            ]
        );
        assert_eq!(config.memory, Some(64 * 1024 * 1024));
        assert_eq!(config.memory_swap, config.memory);
    }

    #[test]
    fn host_config_carries_ulimits() {
        let config = host_config(&spec(None));
        let ulimits = config.ulimits.unwrap();

        assert_eq!(config.binds.unwrap().len(), 1);
        assert_eq!(ulimits.len(), 2);
        assert_eq!(ulimits[0].name.as_deref(), Some("cpu"));
        assert_eq!((ulimits[0].soft, ulimits[0].hard), (Some(2), Some(2)));
        assert_eq!(ulimits[1].name.as_deref(), Some("fsize"));
        assert_eq!(ulimits[1].hard, Some(4096));
    }

    #[test]
    fn parses_docker_timestamps() {
        let state = SandboxState {
            started_at: parse_timestamp("2024-03-01T10:00:00.100000000Z"),
            finished_at: parse_timestamp("2024-03-01T10:00:01.350000000Z"),
            oom_killed: false,
        };
        assert_eq!(state.duration_secs(), Some(1.25));
    }

    #[test]
    fn unfinished_container_has_unknown_duration() {
        let state = SandboxState {
            started_at: parse_timestamp("2024-03-01T10:00:00Z"),
            finished_at: parse_timestamp("0001-01-01T00:00:00Z"),
            oom_killed: false,
        };
        assert_eq!(state.duration_secs(), None);
    }

    #[test]
    fn recognises_not_found_responses() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such image".to_string(),
        };
        assert!(has_status(&err, 404));
        assert!(!has_status(&DockerError::RequestTimeoutError, 404));
    }

    async fn elapsed() -> Elapsed {
        tokio::time::timeout(Duration::ZERO, std::future::pending::<()>())
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn deadline_and_read_timeout_both_mean_wait_timeout() {
        assert!(matches!(wait_outcome(Err(elapsed().await)), Err(SandboxError::WaitTimeout)));
        assert!(matches!(
            wait_outcome(Ok(Some(Err(DockerError::RequestTimeoutError)))),
            Err(SandboxError::WaitTimeout)
        ));
    }

    #[test]
    fn non_zero_exit_reported_as_wait_error_is_an_exit_code() {
        let err = DockerError::DockerContainerWaitError {
            error: String::new(),
            code: 137,
        };
        assert_eq!(wait_outcome(Ok(Some(Err(err)))).unwrap(), 137);

        let response = ContainerWaitResponse {
            status_code: 0,
            error: None,
        };
        assert_eq!(wait_outcome(Ok(Some(Ok(response)))).unwrap(), 0);
    }

    #[test]
    fn other_wait_failures_are_backend_errors() {
        let err = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "daemon restarting".to_string(),
        };
        assert!(matches!(
            wait_outcome(Ok(Some(Err(err)))),
            Err(SandboxError::Backend { op: "wait container", message }) if message.contains("daemon restarting")
        ));
        assert!(matches!(
            wait_outcome(Ok(None)),
            Err(SandboxError::Backend { op: "wait container", .. })
        ));
    }
}
