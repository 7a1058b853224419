mod archive;
mod config;
mod controller;
mod executor;
mod history;
mod images;
mod parsers;

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::{error, info, warn};

use vulcan_common::bus::{self, ProjectRemovalRequest, ProjectUploadRequest, ReplyPayload};

use config::RunnerConfig;
use controller::SubmissionController;
use executor::ContainerExecutor;
use images::ImageManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    dotenvy::dotenv().ok();

    info!("Vulcan runner booting...");

    let config = Arc::new(RunnerConfig::from_env());
    std::fs::create_dir_all(&config.scratch_root)?;

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", config.redis_url);

    let executor = match ContainerExecutor::connect(config.docker_socket.as_deref()) {
        Ok(executor) => executor,
        Err(e) => {
            error!(error = %e, "container engine unavailable");
            std::process::exit(2);
        }
    };
    info!(
        concurrency = config.submission_concurrency,
        default_timeout_sec = config.default_container_timeout_sec,
        "Runner configured"
    );

    let manager = Arc::new(ImageManager::new(
        executor.clone(),
        conn.clone(),
        Arc::clone(&config),
    ));
    let submissions = SubmissionController::new(conn.clone(), executor, Arc::clone(&config));

    let shutdown = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        warn!("Received SIGTERM/CTRL+C - shutting down after in-flight work");
    };

    tokio::select! {
        _ = submissions.run_workers() => {},
        _ = image_worker(conn.clone(), manager) => {},
        _ = shutdown => {},
    }

    info!("Runner shutdown complete");
    Ok(())
}

/// Single worker for the rare project channels. Builds are serialized here
/// on purpose: concurrent builds against one daemon thrash the layer cache.
async fn image_worker(mut conn: redis::aio::ConnectionManager, manager: Arc<ImageManager>) {
    let queues = [bus::project_upload_queue(), bus::project_removal_queue()];
    info!("image worker ready");

    loop {
        let popped = match bus::pop_any(&mut conn, &queues[..], 5.0).await {
            Ok(Some(popped)) => popped,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "image queue pop failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let (queue, payload) = popped;
        if queue == queues[0] {
            let request: ProjectUploadRequest = match serde_json::from_str(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "discarding malformed upload request");
                    continue;
                }
            };
            handle_upload(&mut conn, &manager, request).await;
        } else {
            let request: ProjectRemovalRequest = match serde_json::from_str(&payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "discarding malformed removal request");
                    continue;
                }
            };
            // One-way channel: failures are logged, nobody is waiting.
            if let Err(e) = manager.remove(&request.project_name).await {
                warn!(project = %request.project_name, error = %e, "project removal failed");
            }
        }
    }
}

async fn handle_upload(
    conn: &mut redis::aio::ConnectionManager,
    manager: &ImageManager,
    request: ProjectUploadRequest,
) {
    info!(
        project = %request.project_name,
        correlation_id = %request.correlation_id,
        archive_bytes = request.archive.0.len(),
        "template upload dequeued"
    );

    let payload = match manager
        .build(
            &request.project_name,
            request.config.as_ref(),
            &request.archive.0,
        )
        .await
    {
        Ok(execution) => ReplyPayload::Ok { execution },
        Err(app_error) => {
            warn!(
                project = %request.project_name,
                kind = ?app_error.kind,
                message = %app_error.message,
                "template build failed"
            );
            ReplyPayload::Error(app_error)
        }
    };

    if let Err(e) =
        bus::publish_reply(conn, &request.reply_to, request.correlation_id, payload).await
    {
        error!(correlation_id = %request.correlation_id, error = %e, "reply publish failed");
    }
}
