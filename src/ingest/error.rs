use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::dispatch::RegistryError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum IngestError {
    NotFound,
    MalformedPath { path: String },
    InvalidTopic { topic: String },
    UnsupportedSuffix { suffix: String },
    MissingTenant,
    InvalidTenant { tenant: String },
    /// No tenant secret was provided, so the queue is off for the tenant.
    QueueDisabled,
    InvalidHash,
    Storage(StorageError),
    Registry(RegistryError),
    Internal(String),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MalformedPath { .. }
            | Self::InvalidTopic { .. }
            | Self::UnsupportedSuffix { .. }
            | Self::MissingTenant
            | Self::InvalidTenant { .. } => StatusCode::BAD_REQUEST,
            Self::QueueDisabled | Self::InvalidHash => StatusCode::FORBIDDEN,
            Self::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short client-facing body; never carries internal details.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NotFound => "Not found.",
            Self::MalformedPath { .. } => "Malformed queue path.",
            Self::InvalidTopic { .. } => "Invalid topic.",
            Self::UnsupportedSuffix { .. } => "Unsupported suffix.",
            Self::MissingTenant => "Missing tenant.",
            Self::InvalidTenant { .. } => "Invalid tenant.",
            Self::QueueDisabled => "Queue disabled.",
            Self::InvalidHash => "Invalid hash.",
            Self::Storage(_) => "Failed storing msg.",
            Self::Registry(_) => "Queue unavailable.",
            Self::Internal(_) => "Internal error.",
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "path is outside the queue prefix"),
            Self::MalformedPath { path } => write!(f, "malformed queue path '{path}'"),
            Self::InvalidTopic { topic } => write!(f, "invalid topic '{topic}'"),
            Self::UnsupportedSuffix { suffix } => write!(f, "unsupported suffix '.{suffix}'"),
            Self::MissingTenant => write!(f, "tenant header is missing"),
            Self::InvalidTenant { tenant } => write!(f, "invalid tenant '{tenant}'"),
            Self::QueueDisabled => write!(f, "tenant secret header is missing"),
            Self::InvalidHash => write!(f, "topic hash does not match"),
            Self::Storage(source) => write!(f, "failed to store job: {source}"),
            Self::Registry(source) => write!(f, "failed to publish job: {source}"),
            Self::Internal(message) => write!(f, "internal ingestion failure: {message}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        (self.status_code(), self.public_message()).into_response()
    }
}
