use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::{LifecycleError, OrchestratorError, ValidationError};
use crate::store::StoreError;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://labfleet.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        err.problem.retryable = true;
        err
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }
}

fn validation_code(err: &ValidationError) -> &'static str {
    match err {
        ValidationError::UnknownMode(_) => "invalid_mode",
        ValidationError::UnknownAccessType(_) | ValidationError::EmptyAccessTypes => {
            "invalid_access_types"
        }
        ValidationError::UnknownStatus(_) => "invalid_status",
        ValidationError::SelectorsNotAllowed { .. } => "selectors_not_allowed",
        ValidationError::NoGroupsSelected => "no_groups_selected",
        ValidationError::EmptyMemberSelection => "empty_member_selection",
        ValidationError::UnknownGroup { .. } => "unknown_group",
        ValidationError::NotActiveMember { .. } => "inactive_member",
        ValidationError::CourseNotFound(_) => "course_not_found",
        ValidationError::NoActiveMembers(_) => "no_active_members",
        ValidationError::InvalidTemplateRef(_) => "invalid_template_ref",
        ValidationError::InvalidId { .. } => "invalid_id",
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match &err {
            OrchestratorError::Validation(v) => Self::bad_request(validation_code(v), v.to_string()),
            OrchestratorError::NotFound { kind, .. } => {
                Self::not_found(format!("{kind}_not_found"), err.to_string())
            }
            OrchestratorError::Lifecycle(LifecycleError::NotFound(_)) => {
                Self::not_found("instance_not_found", err.to_string())
            }
            OrchestratorError::Lifecycle(e) if e.is_stale() => {
                Self::conflict("stale_transition", err.to_string())
            }
            OrchestratorError::Store(StoreError::Duplicate(_)) => {
                Self::conflict("duplicate_deployment", err.to_string())
            }
            OrchestratorError::Directory(_) => {
                tracing::warn!(error = %err, "Course directory unavailable");
                Self::service_unavailable(
                    "directory_unavailable",
                    "Course directory is unavailable",
                )
            }
            OrchestratorError::Lifecycle(_) | OrchestratorError::Store(_) => {
                // Storage detail stays in the logs.
                tracing::error!(error = %err, "Request failed");
                Self::internal("internal_error", "Internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labfleet_id::{CourseId, InstanceId, JobId};

    #[test]
    fn validation_maps_to_bad_request() {
        let course_id = CourseId::new();
        let err = ApiError::from(OrchestratorError::from(ValidationError::NoActiveMembers(
            course_id,
        )));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.problem.code, "no_active_members");
        assert!(err.problem.detail.contains(&course_id.to_string()));
    }

    #[test]
    fn stale_maps_to_conflict() {
        let err = ApiError::from(OrchestratorError::from(LifecycleError::AlreadyClaimed {
            instance_id: InstanceId::new(),
            claimed_by: JobId::new(),
        }));
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[test]
    fn store_failures_hide_detail() {
        let err = ApiError::from(OrchestratorError::from(StoreError::Database(
            "password authentication failed for user labfleet".into(),
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.problem.detail.contains("password"));
    }

    #[test]
    fn request_id_fills_instance() {
        let err = ApiError::not_found("deployment_not_found", "nope").with_request_id("req_1");
        assert_eq!(err.problem.request_id, "req_1");
        assert_eq!(err.problem.instance.as_deref(), Some("req_1"));
    }
}
