//! API error type and the shared `{"error": <kind>, "detail": ...}` shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use validator::{ValidationErrors, ValidationErrorsKind};

/// One schema-level validation problem, with a dotted field path.
#[derive(Debug, Clone, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Every error a handler can return; each variant is one response shape.
#[derive(Debug)]
pub enum ApiError {
    /// 400: the executor rejected a structurally valid payload.
    Validation(String),

    /// 404: unknown job, or endpoint not applicable to the job type.
    NotFound(String),

    /// 409: operation not valid in the job's current state.
    Conflict(String),

    /// 422: schema-level validation failure.
    InvalidRequest(Vec<FieldIssue>),

    /// 503: worker pool dead or stalled.
    Unavailable(String),

    /// 500: everything else; detail is sanitized.
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = match &self {
            ApiError::InvalidRequest(issues) => json!(issues),
            ApiError::Validation(detail)
            | ApiError::NotFound(detail)
            | ApiError::Conflict(detail)
            | ApiError::Unavailable(detail)
            | ApiError::Internal(detail) => json!(detail),
        };
        let body = json!({
            "error": self.kind(),
            "detail": detail,
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<promptforge_core::Error> for ApiError {
    fn from(err: promptforge_core::Error) -> Self {
        use promptforge_core::Error;
        match err {
            Error::Validation(message) => ApiError::Validation(message),
            Error::NotFound(message) => ApiError::NotFound(message),
            Error::Conflict(message) => ApiError::Conflict(message),
            other => {
                tracing::error!("Internal error: {other}");
                ApiError::Internal("Internal server error".to_string())
            }
        }
    }
}

/// Flatten validator output into dotted-path field issues.
pub fn issues_from_validation(errors: &ValidationErrors) -> Vec<FieldIssue> {
    let mut issues = Vec::new();
    collect_issues(errors, "", &mut issues);
    issues
}

fn join_path(prefix: &str, field: &str) -> String {
    // Schema-level errors arrive under the synthetic __all__ key.
    if field == "__all__" {
        if prefix.is_empty() {
            "body".to_string()
        } else {
            prefix.to_string()
        }
    } else if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn collect_issues(errors: &ValidationErrors, prefix: &str, out: &mut Vec<FieldIssue>) {
    for (field, kind) in errors.errors() {
        let path = join_path(prefix, field);
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for err in field_errors {
                    out.push(FieldIssue {
                        field: path.clone(),
                        message: err
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| "Invalid value".to_string()),
                        kind: err.code.to_string(),
                    });
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_issues(nested, &path, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_issues(nested, &format!("{path}[{index}]"), out);
                }
            }
        }
    }
}

/// Single-issue 422 helper for failures without a precise field path.
pub fn body_issue(message: impl Into<String>, kind: &str) -> ApiError {
    ApiError::InvalidRequest(vec![FieldIssue {
        field: "body".to_string(),
        message: message.into(),
        kind: kind.to_string(),
    }])
}
