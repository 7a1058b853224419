use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::image::{BuildImageOptions, RemoveImageOptions};
use chrono::Utc;
use futures_util::stream::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use vulcan_common::error::{AppError, ErrorKind};
use vulcan_common::types::{
    ContainerExecution, ContainerStatus, ExecutionPurpose, Project, ProjectConfig,
};

use crate::archive::{self, ScratchDir};
use crate::config::RunnerConfig;
use crate::executor::ContainerExecutor;
use crate::history;
use crate::parsers;

/// Repository-owned sandbox files overlaid onto every template. The
/// Dockerfile always wins over a caller-supplied one; the entrypoint only
/// fills in when the template does not carry its own.
const DOCKERFILE_TEMPLATE: &str = include_str!("../templates/Dockerfile");
const ENTRYPOINT_TEMPLATE: &str = include_str!("../templates/entrypoint.sh");

static PROJECT_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

pub fn image_tag(project: &str) -> String {
    format!("{}:latest", project)
}

/// Builds and tracks one sandbox image per project. Builds of the same
/// project are serialized by a per-project lock; the image worker already
/// serializes builds globally, the lock keeps the invariant independent of
/// that arrangement.
pub struct ImageManager {
    executor: ContainerExecutor,
    conn: redis::aio::ConnectionManager,
    config: Arc<RunnerConfig>,
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageManager {
    pub fn new(
        executor: ContainerExecutor,
        conn: redis::aio::ConnectionManager,
        config: Arc<RunnerConfig>,
    ) -> Self {
        Self {
            executor,
            conn,
            config,
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn project_lock(&self, project: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        locks
            .entry(project.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Build a sandbox image from a template archive, discover the baseline
    /// test roster, and persist the project record. Returns the history
    /// record of the discovery run.
    pub async fn build(
        &self,
        project: &str,
        config: Option<&ProjectConfig>,
        archive_bytes: &[u8],
    ) -> Result<ContainerExecution, AppError> {
        if !PROJECT_NAME.is_match(project) {
            return Err(AppError::bad_input(format!(
                "invalid project name: {:?}",
                project
            )));
        }

        let lock = self.project_lock(project).await;
        let _build_guard = lock.lock().await;

        // Validation happens entirely before any container work.
        let scratch = ScratchDir::create(
            &self.config.scratch_root,
            &archive::creation_dir_name(project),
        )?;
        archive::extract_archive(archive_bytes, scratch.path())?;
        let project_dir = archive::validate_template(scratch.path())?;

        // Overlay the sandbox files. Caller files win on collision except
        // the Dockerfile, which is always ours.
        std::fs::write(project_dir.join("Dockerfile"), DOCKERFILE_TEMPLATE)
            .map_err(|e| AppError::internal(format!("overlay failed: {}", e)))?;
        let entrypoint = project_dir.join("entrypoint.sh");
        if !entrypoint.exists() {
            std::fs::write(&entrypoint, ENTRYPOINT_TEMPLATE)
                .map_err(|e| AppError::internal(format!("overlay failed: {}", e)))?;
        }

        let tag = image_tag(project);
        let image_id = self.build_image(&tag, &project_dir).await?;
        info!(project = project, image = %image_id, "image built");

        // Baseline discovery: run the snapshot-only path and read the
        // roster off stdout. Anything but the sentinel exit tears the
        // image back down.
        let exec_name = format!("{}_creation_{}", project, Utc::now().timestamp_millis());
        let started_at = Utc::now();
        let timeout = Duration::from_secs(self.config.default_container_timeout_sec);
        let results = match self
            .executor
            .run(&exec_name, &image_id, vec!["snapshot".to_string()], None, timeout)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                self.remove_image_quiet(&image_id).await;
                return Err(e);
            }
        };

        if results.status != ContainerStatus::PurposelyStopped {
            self.remove_image_quiet(&image_id).await;
            let tail: String = results.stderr.chars().take(512).collect();
            return Err(AppError::new(
                ErrorKind::BaselineDiscovery,
                format!(
                    "baseline discovery exited with {:?} (code {:?}): {}",
                    results.status, results.exit_code, tail
                ),
            ));
        }

        let output = parsers::parse_gas_snapshot(&results.stdout);
        let baseline_tests = output.test_names();

        let execution = ContainerExecution {
            id: Uuid::new_v4(),
            project_name: project.to_string(),
            purpose: ExecutionPurpose::ProjectCreation,
            status: ContainerStatus::PurposelyStopped,
            exit_code: results.exit_code,
            elapsed_ms: results.elapsed_ms,
            started_at,
            finished_at: Utc::now(),
            output,
            execution_args: None,
            error_detail: None,
        };

        let record = Project {
            name: project.to_string(),
            image_id: image_id.clone(),
            image_tag: tag,
            built_at: Utc::now(),
            container_timeout_sec: config.and_then(|c| c.container_timeout),
            default_execution_args: config.and_then(|c| c.test_execution_arguments.clone()),
            baseline_tests,
        };

        let mut conn = self.conn.clone();
        history::store_execution(&mut conn, &execution)
            .await
            .map_err(|e| AppError::internal(format!("history write failed: {}", e)))?;
        history::upsert_project(&mut conn, &record)
            .await
            .map_err(|e| AppError::internal(format!("project write failed: {}", e)))?;

        info!(
            project = project,
            tests = record.baseline_tests.len(),
            "project ready"
        );
        Ok(execution)
    }

    /// Remove a project: image (pruned), then metadata. History rows stay.
    pub async fn remove(&self, project: &str) -> Result<(), AppError> {
        let lock = self.project_lock(project).await;
        let _build_guard = lock.lock().await;

        let mut conn = self.conn.clone();
        let record = history::get_project(&mut conn, project)
            .await
            .map_err(|e| AppError::internal(format!("project lookup failed: {}", e)))?;

        let Some(record) = record else {
            return Err(AppError::new(
                ErrorKind::NotFound,
                format!("unknown project: {}", project),
            ));
        };

        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        if let Err(e) = self
            .executor
            .docker()
            .remove_image(&record.image_id, Some(options), None)
            .await
        {
            warn!(project = project, error = %e, "image removal failed");
        }

        history::delete_project(&mut conn, project)
            .await
            .map_err(|e| AppError::internal(format!("project delete failed: {}", e)))?;
        info!(project = project, "project removed");
        Ok(())
    }

    async fn build_image(&self, tag: &str, context_dir: &std::path::Path) -> Result<String, AppError> {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all(".", context_dir)
            .map_err(|e| AppError::internal(format!("context tar failed: {}", e)))?;
        let context = builder
            .into_inner()
            .map_err(|e| AppError::internal(format!("context tar failed: {}", e)))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut last_lines: Vec<String> = Vec::new();
        let mut stream =
            self.executor
                .docker()
                .build_image(options, None, Some(bytes::Bytes::from(context)));

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            last_lines.push(line.to_string());
                            if last_lines.len() > 20 {
                                last_lines.remove(0);
                            }
                        }
                    }
                    if let Some(error) = info.error {
                        self.remove_image_quiet(tag).await;
                        return Err(AppError::new(
                            ErrorKind::ImageBuild,
                            format!("{}\n{}", error, last_lines.join("\n")),
                        ));
                    }
                }
                Err(e) => {
                    self.remove_image_quiet(tag).await;
                    return Err(AppError::new(
                        ErrorKind::ImageBuild,
                        format!("build stream failed: {}\n{}", e, last_lines.join("\n")),
                    ));
                }
            }
        }

        // The build stream's progress records vary by daemon; the inspect
        // endpoint is the one authoritative source for the image id.
        let inspected = self
            .executor
            .docker()
            .inspect_image(tag)
            .await
            .map_err(|e| {
                AppError::new(ErrorKind::ImageBuild, format!("built image vanished: {}", e))
            })?;
        inspected
            .id
            .ok_or_else(|| AppError::new(ErrorKind::ImageBuild, "engine returned image without id"))
    }

    async fn remove_image_quiet(&self, image: &str) {
        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        if let Err(e) = self
            .executor
            .docker()
            .remove_image(image, Some(options), None)
            .await
        {
            warn!(image = image, error = %e, "partial image cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_constrained() {
        assert!(PROJECT_NAME.is_match("token"));
        assert!(PROJECT_NAME.is_match("erc20-vault_v2"));
        assert!(!PROJECT_NAME.is_match(""));
        assert!(!PROJECT_NAME.is_match("-leading"));
        assert!(!PROJECT_NAME.is_match("has space"));
        assert!(!PROJECT_NAME.is_match("path/../traversal"));
    }

    #[test]
    fn image_tag_convention() {
        assert_eq!(image_tag("token"), "token:latest");
    }
}
