use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::{error::ErrorReport, render::RenderError};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const VALIDATION: &str = "validation_error";
    pub const FORBIDDEN: &str = "forbidden";
    pub const NOT_FOUND: &str = "not_found";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const RENDER_FAILED: &str = "render_failed";
    pub const ENGINE_UNAVAILABLE: &str = "engine_unavailable";
    pub const REPO: &str = "repo_error";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    retry_after: Option<u64>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            retry_after: None,
            report: None,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn forbidden(message: &'static str) -> Self {
        Self::new(StatusCode::FORBIDDEN, codes::FORBIDDEN, message, None)
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    /// Seconds are rounded up so clients never retry early.
    pub fn rate_limited(retry_after: std::time::Duration) -> Self {
        let seconds = retry_after
            .as_secs()
            .saturating_add(u64::from(retry_after.subsec_nanos() > 0))
            .max(1);
        let mut error = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            codes::RATE_LIMITED,
            "Rate limit exceeded",
            Some(format!("Retry after {seconds} seconds")),
        );
        error.retry_after = Some(seconds);
        error
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn with_report(mut self, report: ErrorReport) -> Self {
        self.report = Some(report);
        self
    }
}

impl From<RenderError> for ApiError {
    fn from(error: RenderError) -> Self {
        const SOURCE: &str = "infra::http::render_error_to_api_error";
        let api = match &error {
            RenderError::Validation(message) => ApiError::new(
                StatusCode::BAD_REQUEST,
                codes::VALIDATION,
                "Invalid render request",
                Some(message.clone()),
            ),
            RenderError::NotFound(what) => ApiError::new(
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Document not found",
                Some(format!("{what} is unknown or not processed yet")),
            ),
            RenderError::RateLimited { retry_after } => ApiError::rate_limited(*retry_after),
            RenderError::Failed { attempts, .. } => ApiError::new(
                StatusCode::BAD_GATEWAY,
                codes::RENDER_FAILED,
                "Render failed",
                Some(format!("Gave up after {attempts} attempt(s)")),
            ),
            RenderError::Transient(_) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                codes::RENDER_FAILED,
                "Render failed",
                None,
            ),
            RenderError::EngineUnavailable => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::ENGINE_UNAVAILABLE,
                "Rendering is not available",
                None,
            ),
            RenderError::Repository(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REPO,
                "Internal server error",
                None,
            ),
        };
        let status = api.status;
        api.with_report(ErrorReport::from_error(SOURCE, status, &error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                "infra::http::api",
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        report.attach(&mut response);
        response
    }
}
