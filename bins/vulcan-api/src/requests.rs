use chrono::{DateTime, Utc};
use redis::{AsyncCommands, RedisResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vulcan_common::error::AppError;
use vulcan_common::types::ContainerExecution;

/// One row per bus round-trip, owned by the front service.

pub const REQUEST_PREFIX: &str = "vulcan:request";

pub fn request_key(id: &Uuid) -> String {
    format!("{}:{}", REQUEST_PREFIX, id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub id: Uuid,
    pub submitter: String,
    pub status: RequestStatus,
    pub is_error: bool,
    /// Queue depth observed at admission. Informational only.
    pub starting_position_in_queue: usize,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ContainerExecution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MessageRequest {
    pub fn new(submitter: impl Into<String>, correlation_id: Uuid, position: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitter: submitter.into(),
            status: RequestStatus::Pending,
            is_error: false,
            starting_position_in_queue: position,
            correlation_id,
            document_ref: None,
            response: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete_ok(&mut self, execution: ContainerExecution) {
        self.status = RequestStatus::Completed;
        self.is_error = false;
        self.document_ref = Some(execution.id);
        self.response = Some(execution);
        self.completed_at = Some(Utc::now());
    }

    pub fn complete_error(&mut self, error: AppError) {
        self.status = RequestStatus::Completed;
        self.is_error = true;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }
}

fn serde_redis_err(context: &'static str, e: impl std::fmt::Display) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, context, e.to_string()))
}

pub async fn store_request(
    conn: &mut redis::aio::ConnectionManager,
    request: &MessageRequest,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(request).map_err(|e| serde_redis_err("serialization error", e))?;
    conn.set(request_key(&request.id), payload).await
}

pub async fn get_request(
    conn: &mut redis::aio::ConnectionManager,
    id: &Uuid,
) -> RedisResult<Option<MessageRequest>> {
    let payload: Option<String> = conn.get(request_key(id)).await?;
    match payload {
        Some(data) => Ok(Some(
            serde_json::from_str(&data).map_err(|e| serde_redis_err("deserialization error", e))?,
        )),
        None => Ok(None),
    }
}
