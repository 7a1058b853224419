use std::path::PathBuf;

use vulcan_common::config::{env_or, env_parse_or, redis_url};

/// Runner settings, read once at boot.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub redis_url: String,
    /// Override for the Docker socket; `None` uses the platform default.
    pub docker_socket: Option<String>,
    pub submission_concurrency: usize,
    pub default_container_timeout_sec: u64,
    pub scratch_root: PathBuf,
}

impl RunnerConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: redis_url(),
            docker_socket: std::env::var("DOCKER_SOCKET_PATH").ok(),
            submission_concurrency: env_parse_or("SUBMISSION_CONCURRENCY", 4),
            default_container_timeout_sec: env_parse_or("DEFAULT_CONTAINER_TIMEOUT_SEC", 60),
            scratch_root: PathBuf::from(env_or("SCRATCH_ROOT", "/tmp/vulcan")),
        }
    }
}
