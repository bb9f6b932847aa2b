use std::collections::BTreeMap;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use skyport_db::KvError;

use crate::node_client::NodeError;

/// Request-scoped failures. Background tasks log these instead of returning them.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("missing or invalid parameters")]
    Parameter { field_errors: BTreeMap<String, String> },
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("instance is suspended")]
    Suspended,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("node unreachable: {0}")]
    NodeUnreachable(String),
    #[error("node rejected request ({status}): {message}")]
    NodeRejected { status: u16, message: String },
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("store error: {0}")]
    Store(#[from] KvError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn parameter(field: &str, message: impl Into<String>) -> Self {
        let mut field_errors = BTreeMap::new();
        field_errors.insert(field.to_string(), message.into());
        Self::Parameter { field_errors }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Parameter { .. } => "invalid_param",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "permission_denied",
            Self::Suspended => "suspended",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::NodeUnreachable(_) => "agent_unreachable",
            Self::NodeRejected { .. } => "agent_error",
            Self::InvalidWorkflow(_) => "invalid_workflow",
            Self::Store(_) | Self::Io(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Parameter { .. } | Self::InvalidWorkflow(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::Suspended => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NodeUnreachable(_) | Self::NodeRejected { .. } => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            Self::Suspended => Some("contact an administrator to lift the suspension".to_string()),
            Self::NodeUnreachable(_) => Some("check that the node agent is online".to_string()),
            _ => None,
        }
    }
}

impl From<NodeError> for ControlError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Rejected { status, message } => Self::NodeRejected { status, message },
            other => Self::NodeUnreachable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub field_errors: BTreeMap<String, String>,
    pub hint: Option<String>,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    pub fn new(err: ControlError, request_id: &str) -> Self {
        if err.status().is_server_error() {
            tracing::warn!(error = %err, request_id, "request failed");
        }

        let hint = err.hint();
        let status = err.status();
        let code = err.code().to_string();
        let (message, field_errors) = match err {
            ControlError::Parameter { field_errors } => {
                ("missing or invalid parameters".to_string(), field_errors)
            }
            // Surface the upstream body verbatim where the node supplied one.
            ControlError::NodeRejected { message, .. } => (message, BTreeMap::new()),
            other => (other.to_string(), BTreeMap::new()),
        };

        Self {
            code,
            message,
            request_id: request_id.to_string(),
            field_errors,
            hint,
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        ApiError::new(self, "").into_response()
    }
}
