use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use vulcan_common::bus::{self, ReplyPayload, SubmissionRequest};
use vulcan_common::error::AppError;
use vulcan_common::types::{
    args_to_cli_flags, ContainerExecution, ContainerStatus, ExecutionArgs, ExecutionPurpose,
    TestOutput,
};

use crate::archive::{self, ScratchDir};
use crate::config::RunnerConfig;
use crate::executor::ContainerExecutor;
use crate::history;
use crate::parsers;

/// Ceiling on the stderr carried inside a result payload.
const STDERR_BOUND_CHARS: usize = 4096;

fn truncate_output(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// The compare-snapshots invocation: the entrypoint's test mode plus any
/// whitelisted execution arguments.
fn build_command(args: &ExecutionArgs) -> Vec<String> {
    let mut cmd = vec!["test".to_string()];
    cmd.extend(args_to_cli_flags(args));
    cmd
}

/// Everything the submission workers share.
#[derive(Clone)]
pub struct SubmissionController {
    conn: redis::aio::ConnectionManager,
    executor: ContainerExecutor,
    config: Arc<RunnerConfig>,
    /// Caps live containers across all workers; queue mechanics alone do
    /// not bound what a worker may open against the engine.
    run_slots: Arc<Semaphore>,
}

impl SubmissionController {
    pub fn new(
        conn: redis::aio::ConnectionManager,
        executor: ContainerExecutor,
        config: Arc<RunnerConfig>,
    ) -> Self {
        let run_slots = Arc::new(Semaphore::new(config.submission_concurrency));
        Self {
            conn,
            executor,
            config,
            run_slots,
        }
    }

    /// Spawn the fixed worker pool. Resolves only when every worker loop
    /// ends, which in practice means shutdown.
    pub async fn run_workers(self) {
        let mut handles = Vec::new();
        for worker_id in 0..self.config.submission_concurrency {
            let controller = self.clone();
            handles.push(tokio::spawn(controller.worker_loop(worker_id)));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn worker_loop(self, worker_id: usize) {
        info!(worker_id, "submission worker ready");
        let mut conn = self.conn.clone();
        loop {
            match bus::pop::<SubmissionRequest>(&mut conn, &bus::submission_queue(), 5.0).await {
                Ok(Some(request)) => self.handle_request(worker_id, request).await,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker_id, error = %e, "queue pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Run one submission and reply. The pipeline runs in its own task so a
    /// panic (a parser tripping on hostile output, say) is contained here
    /// and surfaces as an INTERNAL record instead of taking the worker down.
    async fn handle_request(&self, worker_id: usize, request: SubmissionRequest) {
        let correlation_id = request.correlation_id;
        let reply_to = request.reply_to.clone();
        let project_name = request.project_name.clone();

        info!(
            worker_id,
            project = %project_name,
            correlation_id = %correlation_id,
            archive_bytes = request.archive.0.len(),
            "submission dequeued"
        );

        let pipeline = {
            let controller = self.clone();
            tokio::spawn(async move { controller.execute_submission(request).await })
        };

        let payload = match pipeline.await {
            Ok(Ok(execution)) => {
                info!(
                    worker_id,
                    correlation_id = %correlation_id,
                    status = ?execution.status,
                    elapsed_ms = execution.elapsed_ms,
                    "submission finished"
                );
                ReplyPayload::Ok { execution }
            }
            Ok(Err(app_error)) => {
                warn!(
                    worker_id,
                    correlation_id = %correlation_id,
                    kind = ?app_error.kind,
                    message = %app_error.message,
                    "submission rejected"
                );
                ReplyPayload::Error(app_error)
            }
            Err(join_error) => {
                error!(
                    worker_id,
                    correlation_id = %correlation_id,
                    error = %join_error,
                    "submission pipeline panicked"
                );
                let execution = self
                    .seal_internal(&project_name, format!("pipeline panicked: {}", join_error))
                    .await;
                ReplyPayload::Ok { execution }
            }
        };

        let mut conn = self.conn.clone();
        if let Err(e) = bus::publish_reply(&mut conn, &reply_to, correlation_id, payload).await {
            error!(correlation_id = %correlation_id, error = %e, "reply publish failed");
        }
    }

    async fn execute_submission(
        &self,
        request: SubmissionRequest,
    ) -> Result<ContainerExecution, AppError> {
        let mut conn = self.conn.clone();

        let project = history::get_project(&mut conn, &request.project_name)
            .await
            .map_err(|e| AppError::internal(format!("project lookup failed: {}", e)))?
            .ok_or_else(|| {
                AppError::new(
                    vulcan_common::error::ErrorKind::ProjectNotFound,
                    format!("unknown project: {}", request.project_name),
                )
            })?;

        let run_name = archive::submission_dir_name(&project.name);
        let scratch = ScratchDir::create(&self.config.scratch_root, &run_name)?;
        archive::extract_archive(&request.archive.0, scratch.path())?;
        let src_root = archive::validate_submission(scratch.path())?;

        // Project defaults first, request arguments override per key.
        let mut args = project.default_execution_args.clone().unwrap_or_default();
        if let Some(overrides) = &request.execution_args {
            for (key, value) in overrides {
                args.insert(key.clone(), value.clone());
            }
        }
        let command = build_command(&args);

        let timeout_sec = request
            .container_timeout_sec
            .or(project.container_timeout_sec)
            .unwrap_or(self.config.default_container_timeout_sec);

        let started_at = Utc::now();
        let permit = self
            .run_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::internal("run slots closed"))?;
        let results = self
            .executor
            .run(
                &run_name,
                &project.image_id,
                command,
                Some(&src_root),
                Duration::from_secs(timeout_sec),
            )
            .await;
        drop(permit);
        let results = results?;

        let (output, error_detail) = match results.status {
            ContainerStatus::Success => (
                parsers::parse_forge_test(&results.stdout)
                    .merge(parsers::parse_gas_diff(&results.stdout)),
                None,
            ),
            ContainerStatus::PurposelyStopped => {
                (parsers::parse_gas_snapshot(&results.stdout), None)
            }
            ContainerStatus::Timeout => (
                TestOutput::default(),
                Some(truncate_output(&results.stderr, STDERR_BOUND_CHARS)),
            ),
            ContainerStatus::ApplicationError | ContainerStatus::Internal => (
                TestOutput::default(),
                Some(format!(
                    "exit code {:?}: {}",
                    results.exit_code,
                    truncate_output(&results.stderr, STDERR_BOUND_CHARS)
                )),
            ),
        };

        let execution = ContainerExecution {
            id: Uuid::new_v4(),
            project_name: project.name.clone(),
            purpose: ExecutionPurpose::Submission,
            status: results.status,
            exit_code: results.exit_code,
            elapsed_ms: results.elapsed_ms,
            started_at,
            finished_at: Utc::now(),
            output,
            execution_args: if args.is_empty() { None } else { Some(args) },
            error_detail,
        };

        history::store_execution(&mut conn, &execution)
            .await
            .map_err(|e| AppError::internal(format!("history write failed: {}", e)))?;

        Ok(execution)
    }

    /// Terminal record for a submission whose pipeline died. Best-effort
    /// persisted; the reply goes out either way.
    async fn seal_internal(&self, project_name: &str, detail: String) -> ContainerExecution {
        let now = Utc::now();
        let execution = ContainerExecution {
            id: Uuid::new_v4(),
            project_name: project_name.to_string(),
            purpose: ExecutionPurpose::Submission,
            status: ContainerStatus::Internal,
            exit_code: None,
            elapsed_ms: 0,
            started_at: now,
            finished_at: now,
            output: TestOutput::default(),
            execution_args: None,
            error_detail: Some(detail),
        };
        let mut conn = self.conn.clone();
        if let Err(e) = history::store_execution(&mut conn, &execution).await {
            warn!(error = %e, "internal record write failed");
        }
        execution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_test_mode_plus_whitelisted_flags() {
        let mut args = ExecutionArgs::new();
        args.insert("matchTest".to_string(), "testTransfer".to_string());
        args.insert("fuzzRuns".to_string(), "64".to_string());
        args.insert("rpcUrl".to_string(), "http://evil".to_string());

        let cmd = build_command(&args);
        assert_eq!(
            cmd,
            vec!["test", "--match-test", "testTransfer", "--fuzz-runs", "64"]
        );
    }

    #[test]
    fn empty_args_give_bare_test_mode() {
        assert_eq!(build_command(&ExecutionArgs::new()), vec!["test"]);
    }

    #[test]
    fn stderr_truncation_is_char_safe() {
        let noisy = "é".repeat(10_000);
        let truncated = truncate_output(&noisy, STDERR_BOUND_CHARS);
        assert_eq!(truncated.chars().count(), STDERR_BOUND_CHARS);
    }
}
