use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use redis::{AsyncCommands, RedisResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::types::{ContainerExecution, ExecutionArgs, ProjectConfig};

/// Bus semantics shared by both services. Queue names are deterministic so
/// the front service and the runner never drift.

pub const QUEUE_PREFIX: &str = "vulcan:queue";
pub const REPLY_PREFIX: &str = "vulcan:reply";

pub fn project_upload_queue() -> String {
    format!("{}:project-upload", QUEUE_PREFIX)
}

pub fn submission_queue() -> String {
    format!("{}:submission", QUEUE_PREFIX)
}

pub fn project_removal_queue() -> String {
    format!("{}:project-removal", QUEUE_PREFIX)
}

pub fn reply_queue(instance: &str) -> String {
    format!("{}:{}", REPLY_PREFIX, instance)
}

/// Raw archive bytes carried inside a bus envelope, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePayload(pub Vec<u8>);

impl Serialize for ArchivePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for ArchivePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(ArchivePayload)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectUploadRequest {
    pub project_name: String,
    pub correlation_id: Uuid,
    pub reply_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ProjectConfig>,
    pub archive: ArchivePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub project_name: String,
    pub correlation_id: Uuid,
    pub reply_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_args: Option<ExecutionArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_timeout_sec: Option<u64>,
    pub archive: ArchivePayload,
}

/// One-way message, no reply expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRemovalRequest {
    pub project_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ReplyPayload {
    Ok { execution: ContainerExecution },
    Error(AppError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusReply {
    pub correlation_id: Uuid,
    pub payload: ReplyPayload,
}

fn serde_redis_err(context: &'static str, e: impl std::fmt::Display) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, context, e.to_string()))
}

/// Publish a message onto a queue. RPUSH for FIFO semantics.
pub async fn push<T: Serialize>(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    message: &T,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(message).map_err(|e| serde_redis_err("serialization error", e))?;
    conn.rpush(queue, payload).await
}

/// Blocking pop with timeout so consumers can observe shutdown.
pub async fn pop<T: DeserializeOwned>(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
    timeout_seconds: f64,
) -> RedisResult<Option<T>> {
    let result: Option<(String, String)> = conn.blpop(queue, timeout_seconds).await?;
    match result {
        Some((_key, payload)) => {
            let message = serde_json::from_str(&payload)
                .map_err(|e| serde_redis_err("deserialization error", e))?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

/// Blocking pop across several queues at once; returns the queue the
/// payload came from so the caller can dispatch on it.
pub async fn pop_any(
    conn: &mut redis::aio::ConnectionManager,
    queues: &[String],
    timeout_seconds: f64,
) -> RedisResult<Option<(String, String)>> {
    conn.blpop(queues, timeout_seconds).await
}

/// Current depth of a queue. Informational only: stamped onto requests as
/// their starting position, never used for load shedding.
pub async fn queue_depth(
    conn: &mut redis::aio::ConnectionManager,
    queue: &str,
) -> RedisResult<usize> {
    conn.llen(queue).await
}

/// Publish a reply onto the requester's reply queue.
pub async fn publish_reply(
    conn: &mut redis::aio::ConnectionManager,
    reply_to: &str,
    correlation_id: Uuid,
    payload: ReplyPayload,
) -> RedisResult<()> {
    let reply = BusReply {
        correlation_id,
        payload,
    };
    push(conn, reply_to, &reply).await
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<ReplyPayload>>>>;

/// Typed request/reply client for the front service. `request` publishes
/// onto a request queue and resolves when the single reply-consumer task
/// demultiplexes the matching correlation id off this instance's reply
/// queue. Replies nobody is waiting for are dropped with a warning.
#[derive(Clone)]
pub struct RequestClient {
    conn: redis::aio::ConnectionManager,
    instance: String,
    pending: PendingMap,
}

impl RequestClient {
    pub fn new(conn: redis::aio::ConnectionManager, instance: impl Into<String>) -> Self {
        Self {
            conn,
            instance: instance.into(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn reply_queue(&self) -> String {
        reply_queue(&self.instance)
    }

    /// Start the reply demultiplexer. One task per client instance.
    pub fn spawn_reply_consumer(&self) -> JoinHandle<()> {
        let mut conn = self.conn.clone();
        let queue = self.reply_queue();
        let pending = Arc::clone(&self.pending);

        tokio::spawn(async move {
            loop {
                match pop::<BusReply>(&mut conn, &queue, 5.0).await {
                    Ok(Some(reply)) => {
                        let waiter = pending.lock().await.remove(&reply.correlation_id);
                        match waiter {
                            Some(tx) => {
                                // Receiver may have timed out already.
                                let _ = tx.send(reply.payload);
                            }
                            None => {
                                warn!(
                                    correlation_id = %reply.correlation_id,
                                    "dropping orphan reply with no waiter"
                                );
                            }
                        }
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(error = %e, "reply consumer redis error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    /// Publish `message` on `queue` and await the correlated reply. On
    /// deadline expiry the waiter is deregistered and the caller gets
    /// `TIMEOUT_WAITING_FOR_RUNNER`; the runner's work is not cancelled and
    /// its eventual reply is discarded by the consumer.
    pub async fn request<T: Serialize>(
        &self,
        queue: &str,
        correlation_id: Uuid,
        message: &T,
        deadline: Duration,
    ) -> Result<ReplyPayload, AppError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, tx);

        let mut conn = self.conn.clone();
        if let Err(e) = push(&mut conn, queue, message).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(AppError::internal(format!("bus publish failed: {}", e)));
        }
        debug!(correlation_id = %correlation_id, queue = queue, "request published");

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                // Consumer task dropped the sender; treat as infrastructure.
                self.pending.lock().await.remove(&correlation_id);
                Err(AppError::internal("reply channel closed"))
            }
            Err(_) => {
                self.pending.lock().await.remove(&correlation_id);
                Err(AppError::new(
                    ErrorKind::TimeoutWaitingForRunner,
                    format!("no reply within {}s", deadline.as_secs()),
                ))
            }
        }
    }

    /// Fire-and-forget publish, for one-way channels.
    pub async fn publish<T: Serialize>(&self, queue: &str, message: &T) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        push(&mut conn, queue, message)
            .await
            .map_err(|e| AppError::internal(format!("bus publish failed: {}", e)))
    }
}
