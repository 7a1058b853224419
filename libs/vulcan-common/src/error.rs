use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy for everything that can fail across the service boundary.
/// Failing test runs are not in here: a submission that ran and reported
/// failures is a successful execution whose payload says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    BadInput,
    NotFound,
    ImageBuild,
    BaselineDiscovery,
    ProjectNotFound,
    DockerUnavailable,
    TimeoutWaitingForRunner,
    Internal,
}

impl ErrorKind {
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::BadInput => 400,
            ErrorKind::NotFound | ErrorKind::ProjectNotFound => 404,
            ErrorKind::ImageBuild | ErrorKind::BaselineDiscovery => 422,
            ErrorKind::DockerUnavailable => 503,
            ErrorKind::TimeoutWaitingForRunner => 504,
            ErrorKind::Internal => 500,
        }
    }
}

/// The error shape that crosses the bus and the HTTP boundary.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(ErrorKind::BadInput.http_status(), 400);
        assert_eq!(ErrorKind::ProjectNotFound.http_status(), 404);
        assert_eq!(ErrorKind::ImageBuild.http_status(), 422);
        assert_eq!(ErrorKind::BaselineDiscovery.http_status(), 422);
        assert_eq!(ErrorKind::DockerUnavailable.http_status(), 503);
        assert_eq!(ErrorKind::TimeoutWaitingForRunner.http_status(), 504);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn wire_format_uses_screaming_snake() {
        let err = AppError::new(ErrorKind::BaselineDiscovery, "no tests found");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "BASELINE_DISCOVERY");
        assert_eq!(json["message"], "no tests found");
    }
}
