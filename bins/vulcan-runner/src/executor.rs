use std::path::Path;
use std::time::{Duration, Instant};

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, warn};

use vulcan_common::error::{AppError, ErrorKind};
use vulcan_common::types::ContainerStatus;

/// Mount point the sandbox image expects the submission tree at. The
/// entrypoint overlays it onto the project workspace before running the
/// tool, re-copying the image's tests over anything the submission brought.
pub const SUBMISSION_MOUNT: &str = "/submission";

/// Seconds a timed-out container gets to stop before the engine kills it.
const STOP_GRACE_SECS: i64 = 5;

#[derive(Debug, Clone)]
pub struct ContainerResults {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
    pub elapsed_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

/// Removal guard so a container never outlives its run, even when the
/// pipeline above it panics or is cancelled.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container = %container_id, error = %e, "container cleanup failed");
            }
        });
    }
}

fn classify_engine_error(e: bollard::errors::Error) -> AppError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => AppError::new(ErrorKind::ProjectNotFound, "image not present on engine"),
        other => AppError::new(
            ErrorKind::DockerUnavailable,
            format!("container engine error: {}", other),
        ),
    }
}

/// Thin wrapper around the host container engine. Runs exactly one
/// container per call and reports the outcome; it never interprets output.
#[derive(Clone)]
pub struct ContainerExecutor {
    docker: Docker,
}

impl ContainerExecutor {
    pub fn connect(socket: Option<&str>) -> Result<Self, AppError> {
        let docker = match socket {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| {
            AppError::new(
                ErrorKind::DockerUnavailable,
                format!("cannot reach container engine: {}", e),
            )
        })?;
        Ok(Self { docker })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Launch `image` with `cmd`, optionally bind-mounting a submission
    /// source tree, and wait for it to exit within `timeout`. The container
    /// is removed afterwards on every path.
    pub async fn run(
        &self,
        exec_name: &str,
        image: &str,
        cmd: Vec<String>,
        src_mount_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<ContainerResults, AppError> {
        let binds = src_mount_dir
            .map(|dir| vec![format!("{}:{}", dir.display(), SUBMISSION_MOUNT)]);

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds,
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: exec_name,
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(classify_engine_error)?;
        let container_id = container.id.clone();

        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let started = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify_engine_error)?;

        let run_future = async {
            let (stdout, stderr) = self.collect_logs(&container_id, true).await;
            let exit_code = self.wait_for_exit(&container_id).await;
            (stdout, stderr, exit_code)
        };

        match tokio::time::timeout(timeout, run_future).await {
            Ok((stdout, stderr, exit_code)) => {
                let status = match exit_code {
                    Some(code) => ContainerStatus::from_exit_code(code),
                    None => ContainerStatus::Internal,
                };
                debug!(
                    container = exec_name,
                    ?status,
                    exit_code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "container finished"
                );
                Ok(ContainerResults {
                    status,
                    exit_code,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    stdout,
                    stderr,
                })
            }
            Err(_) => {
                warn!(container = exec_name, timeout_secs = timeout.as_secs(), "container timed out, stopping");
                if let Err(e) = self
                    .docker
                    .stop_container(&container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
                    .await
                {
                    warn!(container = exec_name, error = %e, "stop after timeout failed");
                }
                // Partial output is still worth reporting.
                let (stdout, stderr) = self.collect_logs(&container_id, false).await;
                Ok(ContainerResults {
                    status: ContainerStatus::Timeout,
                    exit_code: None,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    stdout,
                    stderr,
                })
            }
        }
    }

    async fn collect_logs(&self, container_id: &str, follow: bool) -> (String, String) {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            ..Default::default()
        });

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.docker.logs(container_id, options);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = container_id, error = %e, "log stream error");
                    break;
                }
            }
        }
        (stdout, stderr)
    }

    /// The engine reports non-zero exits through the wait error variant, so
    /// both arms carry a usable status code.
    async fn wait_for_exit(&self, container_id: &str) -> Option<i64> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut stream = self.docker.wait_container(container_id, options);
        match stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(container = container_id, error = %e, "wait failed");
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_404_maps_to_missing_image() {
        let err = classify_engine_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such image".to_string(),
        });
        assert_eq!(err.kind, ErrorKind::ProjectNotFound);
    }

    #[test]
    fn other_engine_errors_are_retryable() {
        let err = classify_engine_error(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon on fire".to_string(),
        });
        assert_eq!(err.kind, ErrorKind::DockerUnavailable);
    }

    /// Requires a running Docker daemon.
    #[tokio::test]
    #[ignore]
    async fn run_reports_exit_code_zero() {
        let executor = ContainerExecutor::connect(None).expect("docker");
        let results = executor
            .run(
                "vulcan_exec_test_ok",
                "alpine:latest",
                vec!["true".to_string()],
                None,
                Duration::from_secs(30),
            )
            .await
            .expect("run");
        assert_eq!(results.status, ContainerStatus::Success);
        assert_eq!(results.exit_code, Some(0));
    }

    /// Requires a running Docker daemon.
    #[tokio::test]
    #[ignore]
    async fn run_times_out_and_stops_container() {
        let executor = ContainerExecutor::connect(None).expect("docker");
        let results = executor
            .run(
                "vulcan_exec_test_timeout",
                "alpine:latest",
                vec!["sleep".to_string(), "60".to_string()],
                None,
                Duration::from_secs(2),
            )
            .await
            .expect("run");
        assert_eq!(results.status, ContainerStatus::Timeout);
    }
}
