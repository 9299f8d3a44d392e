use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{
        HeaderName, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    application::{
        error::ErrorReport,
        render::RenderCoordinator,
        repos::{ObjectStore, RepoError},
        signer::SignatureError,
    },
    domain::render::{CacheStatus, RenderedImage},
};

use super::{
    error::ApiError,
    middleware::{log_responses, set_request_context},
};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_RENDER_DEGRADED: HeaderName = HeaderName::from_static("x-render-degraded");

const CACHE_CONTROL_HIT: &str = "public, max-age=31536000, immutable";
const CACHE_CONTROL_MISS: &str = "public, max-age=300";
const CACHE_CONTROL_NO_STORE: &str = "no-store";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RenderCoordinator>,
    /// Backs the signed `/source` route.
    pub objects: Arc<dyn ObjectStore>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/render/{document_id}/page/{page}", get(render_page))
        .route("/thumbnail/{document_id}", get(render_thumbnail))
        .route("/render-status/{document_id}", get(render_status))
        .route("/source/{*key}", get(serve_source))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RenderQuery {
    width: Option<String>,
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SourceQuery {
    expires: Option<String>,
    signature: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    engine_available: bool,
}

fn parse_number(raw: &str, message: &'static str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ApiError::bad_request(message, Some(format!("`{raw}` is not an integer"))))
}

async fn render_page(
    State(state): State<AppState>,
    Path((document_id, page)): Path<(String, String)>,
    Query(query): Query<RenderQuery>,
) -> Response {
    let canonical = state.coordinator.defaults().canonical;
    let parsed = (|| {
        let page = parse_number(&page, "Invalid page number")?;
        let width = match query.width.as_deref() {
            Some(raw) => parse_number(raw, "Invalid width")?,
            None => i64::from(canonical.width),
        };
        let quality = match query.quality.as_deref() {
            Some(raw) => parse_number(raw, "Invalid quality")?,
            None => i64::from(canonical.quality),
        };
        Ok::<_, ApiError>((page, width, quality))
    })();
    let (page, width, quality) = match parsed {
        Ok(values) => values,
        Err(err) => return err.into_response(),
    };
    let format = query
        .format
        .unwrap_or_else(|| canonical.format.as_str().to_string());

    match state
        .coordinator
        .render_page(&document_id, page, width, &format, quality)
        .await
    {
        Ok(image) => image_response(image),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn render_thumbnail(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Response {
    match state.coordinator.render_thumbnail(&document_id).await {
        Ok(image) => image_response(image),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn render_status(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Response {
    match state.coordinator.render_status(&document_id).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        engine_available: state.coordinator.engine_available(),
    })
}

async fn serve_source(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SourceQuery>,
) -> Response {
    const SOURCE: &str = "infra::http::render::serve_source";

    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return ApiError::forbidden("Missing signature").into_response();
    };
    let Ok(expires) = expires.parse::<i64>() else {
        return ApiError::forbidden("Invalid signature").into_response();
    };

    match state.coordinator.signer().verify(&key, expires, &signature) {
        Ok(()) => {}
        Err(SignatureError::Expired) => {
            return ApiError::forbidden("Signed URL has expired").into_response();
        }
        Err(_) => return ApiError::forbidden("Invalid signature").into_response(),
    }

    match state.objects.get(&key).await {
        Ok(Some(object)) => {
            let mut response = (StatusCode::OK, object.bytes).into_response();
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&object.content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
            response
        }
        Ok(None) | Err(RepoError::InvalidInput { .. }) => {
            ApiError::not_found("Source not found").into_response()
        }
        Err(err) => {
            error!(
                target = SOURCE,
                key = %key,
                error = %err,
                "failed to read source object"
            );
            let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
            ErrorReport::from_error(SOURCE, StatusCode::INTERNAL_SERVER_ERROR, &err)
                .attach(&mut response);
            response
        }
    }
}

fn image_response(image: RenderedImage) -> Response {
    let cache_control = match image.cache_status {
        CacheStatus::Hit => CACHE_CONTROL_HIT,
        CacheStatus::Miss => CACHE_CONTROL_MISS,
        CacheStatus::Placeholder => CACHE_CONTROL_NO_STORE,
    };

    let mut response = (StatusCode::OK, image.bytes).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&image.content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    headers.insert(
        X_CACHE,
        HeaderValue::from_static(image.cache_status.as_header()),
    );
    if image.degraded {
        headers.insert(X_RENDER_DEGRADED, HeaderValue::from_static("true"));
    }
    response
}
