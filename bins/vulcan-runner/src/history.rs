use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

use vulcan_common::types::{ContainerExecution, Project};

/// Key layout for the runner-owned collections. Deterministic prefixes keep
/// the runner and any operator tooling in agreement.

pub const PROJECT_PREFIX: &str = "vulcan:project";
pub const HISTORY_PREFIX: &str = "vulcan:history";

pub fn project_key(name: &str) -> String {
    format!("{}:{}", PROJECT_PREFIX, name)
}

pub fn history_key(id: &Uuid) -> String {
    format!("{}:{}", HISTORY_PREFIX, id)
}

/// Per-project index of execution ids, append-only. Survives project
/// removal: history is the audit trail.
pub fn history_index_key(project: &str) -> String {
    format!("{}:index:{}", HISTORY_PREFIX, project)
}

fn serde_redis_err(context: &'static str, e: impl std::fmt::Display) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, context, e.to_string()))
}

pub async fn store_execution(
    conn: &mut redis::aio::ConnectionManager,
    execution: &ContainerExecution,
) -> RedisResult<()> {
    let payload = serde_json::to_string(execution)
        .map_err(|e| serde_redis_err("serialization error", e))?;
    let _: () = conn.set(history_key(&execution.id), payload).await?;
    let _: () = conn
        .rpush(
            history_index_key(&execution.project_name),
            execution.id.to_string(),
        )
        .await?;
    Ok(())
}

pub async fn upsert_project(
    conn: &mut redis::aio::ConnectionManager,
    project: &Project,
) -> RedisResult<()> {
    let payload =
        serde_json::to_string(project).map_err(|e| serde_redis_err("serialization error", e))?;
    conn.set(project_key(&project.name), payload).await
}

pub async fn get_project(
    conn: &mut redis::aio::ConnectionManager,
    name: &str,
) -> RedisResult<Option<Project>> {
    let payload: Option<String> = conn.get(project_key(name)).await?;
    match payload {
        Some(data) => Ok(Some(
            serde_json::from_str(&data).map_err(|e| serde_redis_err("deserialization error", e))?,
        )),
        None => Ok(None),
    }
}

pub async fn delete_project(
    conn: &mut redis::aio::ConnectionManager,
    name: &str,
) -> RedisResult<bool> {
    let removed: i64 = conn.del(project_key(name)).await?;
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_deterministic() {
        assert_eq!(project_key("token"), "vulcan:project:token");
        assert_eq!(history_index_key("token"), "vulcan:history:index:token");

        let id = Uuid::new_v4();
        assert_eq!(history_key(&id), history_key(&id));
        assert!(history_key(&id).starts_with("vulcan:history:"));
        assert!(history_key(&id).contains(&id.to_string()));
    }
}
