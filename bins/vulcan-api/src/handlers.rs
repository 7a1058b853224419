use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use tracing::{error, info};
use uuid::Uuid;

use vulcan_common::bus::{
    self, ArchivePayload, ProjectRemovalRequest, ProjectUploadRequest, ReplyPayload,
    SubmissionRequest,
};
use vulcan_common::error::{AppError, ErrorKind};
use vulcan_common::types::ProjectConfig;

use crate::requests::{self, MessageRequest};
use crate::AppState;

/// Response header carrying the MessageRequest id, the handle for
/// `GET /api/v1/requests/:id`.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP rendering of the shared error taxonomy.
#[derive(Debug)]
pub struct ApiError(pub AppError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0)).into_response()
    }
}

impl From<AppError> for ApiError {
    fn from(error: AppError) -> Self {
        ApiError(error)
    }
}

fn submitter_from(headers: &HeaderMap) -> String {
    headers
        .get("x-submitter")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string()
}

/// Pull the archive bytes and the optional JSON config part out of a
/// multipart body. `archive_field` names the required zip part.
async fn read_upload_parts(
    multipart: &mut Multipart,
    archive_field: &str,
) -> Result<(Vec<u8>, Option<ProjectConfig>), ApiError> {
    let mut archive: Option<Vec<u8>> = None;
    let mut config: Option<ProjectConfig> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_input(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(name) if name == archive_field => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_input(format!("unreadable archive part: {}", e)))?;
                archive = Some(bytes.to_vec());
            }
            Some("projectConfig") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_input(format!("unreadable config part: {}", e)))?;
                config = Some(parse_project_config(&text)?);
            }
            _ => {}
        }
    }

    let archive = archive.ok_or_else(|| {
        ApiError::from(AppError::bad_input(format!(
            "missing multipart field: {}",
            archive_field
        )))
    })?;
    if archive.is_empty() {
        return Err(AppError::bad_input("empty archive").into());
    }

    Ok((archive, config))
}

fn parse_project_config(text: &str) -> Result<ProjectConfig, ApiError> {
    serde_json::from_str(text)
        .map_err(|e| AppError::bad_input(format!("bad projectConfig JSON: {}", e)).into())
}

/// POST /api/v1/projects/:name - build a project image from a template zip
pub async fn upload_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let (archive, config) = read_upload_parts(&mut multipart, "projectZip").await?;
    let submitter = submitter_from(&headers);
    let correlation_id = Uuid::new_v4();

    info!(
        project = %name,
        submitter = %submitter,
        correlation_id = %correlation_id,
        archive_bytes = archive.len(),
        "project upload accepted"
    );

    let envelope = ProjectUploadRequest {
        project_name: name,
        correlation_id,
        reply_to: state.client.reply_queue(),
        config,
        archive: ArchivePayload(archive),
    };

    let (request_id, execution) = round_trip(
        &state,
        &bus::project_upload_queue(),
        correlation_id,
        &envelope,
        &submitter,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        [(REQUEST_ID_HEADER, request_id.to_string())],
        Json(execution),
    ))
}

/// POST /api/v1/submissions/:projectName - execute a submission zip
pub async fn execute_submission(
    State(state): State<Arc<AppState>>,
    Path(project_name): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let (archive, config) = read_upload_parts(&mut multipart, "srcZip").await?;
    let submitter = submitter_from(&headers);
    let correlation_id = Uuid::new_v4();

    info!(
        project = %project_name,
        submitter = %submitter,
        correlation_id = %correlation_id,
        archive_bytes = archive.len(),
        "submission accepted"
    );

    let config = config.unwrap_or_default();
    let envelope = SubmissionRequest {
        project_name,
        correlation_id,
        reply_to: state.client.reply_queue(),
        execution_args: config.test_execution_arguments,
        container_timeout_sec: config.container_timeout,
        archive: ArchivePayload(archive),
    };

    let (request_id, execution) = round_trip(
        &state,
        &bus::submission_queue(),
        correlation_id,
        &envelope,
        &submitter,
    )
    .await?;

    Ok((
        StatusCode::OK,
        [(REQUEST_ID_HEADER, request_id.to_string())],
        Json(execution),
    ))
}

/// DELETE /api/v1/projects/:name - one-way removal, no reply expected
pub async fn remove_project(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!(project = %name, "project removal requested");
    state
        .client
        .publish(
            &bus::project_removal_queue(),
            &ProjectRemovalRequest { project_name: name },
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/requests/:id - inspect a bus round-trip record
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let mut conn = state.redis.clone();
    let request = requests::get_request(&mut conn, &id)
        .await
        .map_err(|e| AppError::internal(format!("request lookup failed: {}", e)))?
        .ok_or_else(|| AppError::new(ErrorKind::NotFound, format!("unknown request: {}", id)))?;
    Ok(Json(request))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Publish a request, await the correlated reply, and keep the
/// MessageRequest row in step with the outcome on every path. Returns the
/// row's id alongside the execution so callers can hand it back to the
/// client for `GET /api/v1/requests/:id`.
async fn round_trip<T: serde::Serialize>(
    state: &Arc<AppState>,
    queue: &str,
    correlation_id: Uuid,
    envelope: &T,
    submitter: &str,
) -> Result<(Uuid, vulcan_common::types::ContainerExecution), ApiError> {
    let mut conn = state.redis.clone();
    let position = bus::queue_depth(&mut conn, queue).await.unwrap_or(0) + 1;

    let mut record = MessageRequest::new(submitter, correlation_id, position);
    if let Err(e) = requests::store_request(&mut conn, &record).await {
        error!(correlation_id = %correlation_id, error = %e, "request row write failed");
    }

    let outcome = state
        .client
        .request(queue, correlation_id, envelope, state.reply_timeout)
        .await;

    let result = match outcome {
        Ok(ReplyPayload::Ok { execution }) => {
            record.complete_ok(execution.clone());
            Ok((record.id, execution))
        }
        Ok(ReplyPayload::Error(error)) => {
            record.complete_error(error.clone());
            Err(ApiError(error))
        }
        Err(error) => {
            record.complete_error(error.clone());
            Err(ApiError(error))
        }
    };

    if let Err(e) = requests::store_request(&mut conn, &record).await {
        error!(correlation_id = %correlation_id, error = %e, "request row update failed");
    }

    result
}

pub fn reply_deadline() -> Duration {
    Duration::from_secs(vulcan_common::config::env_parse_or("BUS_REPLY_TIMEOUT_SEC", 300))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_config_parses_both_fields() {
        let config = parse_project_config(
            r#"{"containerTimeout": 30, "testExecutionArguments": {"matchTest": "testFoo"}}"#,
        )
        .unwrap();
        assert_eq!(config.container_timeout, Some(30));
        assert_eq!(
            config
                .test_execution_arguments
                .unwrap()
                .get("matchTest")
                .map(String::as_str),
            Some("testFoo")
        );
    }

    #[test]
    fn bad_config_json_is_rejected() {
        let err = parse_project_config("{nope").unwrap_err();
        assert_eq!(err.0.kind, ErrorKind::BadInput);
    }

    #[test]
    fn unknown_submitter_defaults_to_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(submitter_from(&headers), "anonymous");

        let mut headers = HeaderMap::new();
        headers.insert("x-submitter", "alice".parse().unwrap());
        assert_eq!(submitter_from(&headers), "alice");
    }
}
