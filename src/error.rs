use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};

use crate::budget::BudgetBlock;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Work order '{work_order_id}' is not ready: missing {}", .missing.join(", "))]
    NotReady {
        work_order_id: String,
        missing: Vec<String>,
    },

    #[error("Dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    #[error("Work order '{work_order_id}' already has an active run")]
    ActiveRunExists { work_order_id: String },

    #[error("Transition '{event}' is not allowed from status '{from}'")]
    InvalidTransition { from: String, event: String },

    #[error("'{id}' is no longer in status '{expected}' (now '{actual}')")]
    StaleTransition {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Budget exhausted: {}", .0.reason)]
    BudgetExhausted(Box<BudgetBlock>),

    #[error("Provided inputs do not match the pending escalation")]
    InputMismatch {
        expected: Vec<String>,
        provided: Vec<String>,
    },

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: String,
        message: String,
    },
}

impl AppError {
    pub fn collaborator(collaborator: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Collaborator {
            collaborator: collaborator.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, event: impl ToString) -> Self {
        AppError::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
        }
    }

    /// Machine-readable error kind, stable across message wording changes.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Json(_) => "json",
            AppError::Internal(_) => "internal",
            AppError::Io(_) => "io",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::NotReady { .. } => "not_ready",
            AppError::DependencyCycle { .. } => "dependency_cycle",
            AppError::ActiveRunExists { .. } => "active_run_exists",
            AppError::InvalidTransition { .. } => "invalid_transition",
            AppError::StaleTransition { .. } => "stale_transition",
            AppError::BudgetExhausted(_) => "budget_exhausted",
            AppError::InputMismatch { .. } => "input_mismatch",
            AppError::Collaborator { .. } => "collaborator",
        }
    }

    pub fn details(&self) -> Value {
        match self {
            AppError::NotReady {
                work_order_id,
                missing,
            } => json!({ "work_order_id": work_order_id, "missing": missing }),
            AppError::DependencyCycle { path } => json!({ "cycle_path": path }),
            AppError::ActiveRunExists { work_order_id } => {
                json!({ "work_order_id": work_order_id })
            }
            AppError::InvalidTransition { from, event } => json!({ "from": from, "event": event }),
            AppError::StaleTransition {
                id,
                expected,
                actual,
            } => json!({ "id": id, "expected": expected, "actual": actual }),
            AppError::BudgetExhausted(block) => json!({ "budget_blocked": block }),
            AppError::InputMismatch { expected, provided } => {
                json!({ "expected_keys": expected, "provided_keys": provided })
            }
            AppError::Collaborator { collaborator, .. } => json!({ "collaborator": collaborator }),
            _ => json!({}),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) | AppError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Collaborator { .. } => StatusCode::BAD_GATEWAY,
            AppError::Json(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_)
            | AppError::NotReady { .. }
            | AppError::DependencyCycle { .. }
            | AppError::InputMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::ActiveRunExists { .. }
            | AppError::InvalidTransition { .. }
            | AppError::StaleTransition { .. } => StatusCode::CONFLICT,
            AppError::BudgetExhausted(_) => StatusCode::PAYMENT_REQUIRED,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "details": self.details(),
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<axum::extract::rejection::JsonRejection> for AppError {
    fn from(rej: axum::extract::rejection::JsonRejection) -> Self {
        AppError::BadRequest(rej.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable_per_variant() {
        let err = AppError::ActiveRunExists {
            work_order_id: "wo-1".to_string(),
        };
        assert_eq!(err.kind(), "active_run_exists");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.details()["work_order_id"], "wo-1");
    }

    #[test]
    fn test_not_ready_names_missing_fields() {
        let err = AppError::NotReady {
            work_order_id: "wo-1".to_string(),
            missing: vec!["acceptance_criteria".to_string()],
        };
        assert!(err.to_string().contains("acceptance_criteria"));
        assert_eq!(err.details()["missing"][0], "acceptance_criteria");
    }

    #[test]
    fn test_invalid_transition_details() {
        let err = AppError::invalid_transition("merged", "cancel");
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(err.details()["from"], "merged");
        assert_eq!(err.details()["event"], "cancel");
    }
}
