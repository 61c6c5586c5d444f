use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

use crate::overrides::{ApproveError, OverrideError};
use crate::summarizer::SummarizeError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Failure at the request boundary. Each variant maps to a wire code and an
/// HTTP-equivalent status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadParams(String),
    #[error("select a workspace first")]
    NoWorkspace,
    #[error("sign in first")]
    Unauthenticated,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    /// A batch stopped part way; earlier items stay committed.
    #[error("{0}")]
    PartialFailure(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_params(msg: impl Into<String>) -> Self {
        Self::BadParams(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadParams(_) => "bad_params",
            Self::NoWorkspace => "no_workspace",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unavailable(_) => "summarizer_unavailable",
            Self::PartialFailure(_) => "partial_failure",
            Self::Db(_) | Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::BadParams(_) | Self::NoWorkspace => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Unavailable(_) => 503,
            Self::PartialFailure(_) => 500,
            Self::Db(_) | Self::Internal(_) => 500,
        }
    }

    /// Unexpected failures are logged in full but reported generically.
    fn public_message(&self) -> String {
        match self {
            Self::Db(_) | Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn response(&self, id: &str, method: &str) -> Value {
        if self.status() >= 500 && !matches!(self, Self::Unavailable(_)) {
            error!(method, error = %self, "request failed");
        } else {
            warn!(method, code = self.code(), error = %self, "request rejected");
        }
        err(id, self.code(), self.status(), self.public_message())
    }
}

impl From<OverrideError> for ApiError {
    fn from(e: OverrideError) -> Self {
        match e {
            OverrideError::Unauthenticated => Self::Unauthenticated,
            OverrideError::Empty
            | OverrideError::OutOfRange { .. }
            | OverrideError::StudentMismatch { .. }
            | OverrideError::ComponentMismatch { .. } => Self::BadParams(e.to_string()),
            OverrideError::GradeNotFound { .. } => Self::NotFound(e.to_string()),
            OverrideError::Store { .. } => Self::PartialFailure(e.to_string()),
        }
    }
}

impl From<ApproveError> for ApiError {
    fn from(e: ApproveError) -> Self {
        match e {
            ApproveError::NotFound => Self::NotFound(e.to_string()),
            ApproveError::AlreadyProcessed(_) => Self::Conflict(e.to_string()),
            ApproveError::Store(db) => Self::Db(db),
        }
    }
}

impl From<SummarizeError> for ApiError {
    fn from(e: SummarizeError) -> Self {
        match e {
            SummarizeError::NotFound => Self::NotFound(e.to_string()),
            SummarizeError::Db(db) => Self::Db(db),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

pub fn ok(id: &str, status: u16, data: Value, pagination: Option<Value>) -> Value {
    let mut resp = json!({
        "id": id,
        "success": true,
        "status": status,
        "data": data,
    });
    if let Some(p) = pagination {
        resp["pagination"] = p;
    }
    resp
}

pub fn err(id: &str, code: &str, status: u16, message: impl Into<String>) -> Value {
    json!({
        "id": id,
        "success": false,
        "status": status,
        "code": code,
        "error": message.into(),
    })
}
