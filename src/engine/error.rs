use std::{io, path::PathBuf};

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::{artifact::ArtifactError, sandbox::SandboxError};

/// Infrastructure failures. Verdicts never travel through this type.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported language: {0}")]
    UnknownLanguage(String),
    #[error("unknown check method: {0}")]
    UnknownCheckMethod(String),
    #[error("test case set not found: {0}")]
    TestDataNotFound(String),
    #[error("failed to read test data at {path}: {source}")]
    TestData {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checker {method} could not be started: {source}")]
    CheckerUnavailable {
        method: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("queue is full")]
    QueueFull,
    #[error("judge workers are shut down")]
    QueueClosed,
}

impl JudgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            JudgeError::Unauthorized => "unauthorized",
            JudgeError::InvalidRequest(_) => "invalid_request",
            JudgeError::UnknownLanguage(_) => "unknown_language",
            JudgeError::UnknownCheckMethod(_) => "unknown_check_method",
            JudgeError::TestDataNotFound(_) => "test_data_not_found",
            JudgeError::TestData { .. } => "test_data",
            JudgeError::CheckerUnavailable { .. } => "checker_unavailable",
            JudgeError::Sandbox(SandboxError::ImageNotFound(_)) => "image_not_found",
            JudgeError::Sandbox(_) => "sandbox",
            JudgeError::Artifact(_) => "artifact",
            JudgeError::Configuration(_) => "configuration",
            JudgeError::QueueFull => "queue_full",
            JudgeError::QueueClosed => "queue_closed",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            JudgeError::Unauthorized => StatusCode::UNAUTHORIZED,
            JudgeError::InvalidRequest(_)
            | JudgeError::UnknownLanguage(_)
            | JudgeError::UnknownCheckMethod(_) => StatusCode::BAD_REQUEST,
            JudgeError::TestDataNotFound(_) => StatusCode::NOT_FOUND,
            JudgeError::QueueFull | JudgeError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            JudgeError::Sandbox(_) => StatusCode::BAD_GATEWAY,
            JudgeError::TestData { .. }
            | JudgeError::CheckerUnavailable { .. }
            | JudgeError::Artifact(_)
            | JudgeError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for JudgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}
