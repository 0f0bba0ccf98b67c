use crate::config::store::ConfigError;
use crate::config::types::{AggregationPolicy, FilterRule, Source, SourceSpec};
use crate::control::{ControlError, ControlPlane};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// GET /control/status
pub async fn get_status(State(control): State<Arc<ControlPlane>>) -> Response {
    Json(control.status().await).into_response()
}

/// GET /control/metrics
pub async fn get_metrics(State(control): State<Arc<ControlPlane>>) -> Response {
    Json(control.metrics()).into_response()
}

/// POST /control/reload
pub async fn post_reload(
    State(control): State<Arc<ControlPlane>>,
) -> Result<Response, ApiError> {
    let report = control.reload().await?;
    Ok(Json(report).into_response())
}

/// GET /control/sources
pub async fn list_sources(State(control): State<Arc<ControlPlane>>) -> Response {
    let sources: Vec<Source> = control
        .config()
        .sources()
        .iter()
        .map(|s| s.as_ref().clone())
        .collect();
    Json(sources).into_response()
}

/// POST /control/sources
pub async fn create_source(
    State(control): State<Arc<ControlPlane>>,
    Json(spec): Json<SourceSpec>,
) -> Result<Response, ApiError> {
    let source = control.add_source(spec).await?;
    Ok((StatusCode::CREATED, Json(source.as_ref().clone())).into_response())
}

/// PUT /control/sources/{id}
pub async fn update_source(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
    Json(spec): Json<SourceSpec>,
) -> Result<Response, ApiError> {
    let source = control.update_source(id, spec).await?;
    Ok(Json(source.as_ref().clone()).into_response())
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

/// DELETE /control/sources/{id}
pub async fn delete_source(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    control.delete_source(id).await?;
    Ok(Json(DeletedResponse { deleted: true }).into_response())
}

/// GET /control/sources/{id}/template
pub async fn get_template(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match control.template(id) {
        Some(template) => Ok(Json(template.as_ref().clone()).into_response()),
        None => Err(ApiError::NotFound(format!("no template for source {}", id))),
    }
}

/// DELETE /control/sources/{id}/template
pub async fn delete_template(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let deleted = control.delete_template(id)?;
    Ok(Json(DeletedResponse { deleted }).into_response())
}

/// PUT /control/sources/{id}/filters
pub async fn put_filters(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
    Json(rules): Json<Vec<FilterRule>>,
) -> Result<Response, ApiError> {
    control.set_filters(id, rules)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// PUT /control/sources/{id}/aggregation
///
/// A JSON `null` body clears the policy.
pub async fn put_aggregation(
    State(control): State<Arc<ControlPlane>>,
    Path(id): Path<Uuid>,
    Json(policy): Json<Option<AggregationPolicy>>,
) -> Result<Response, ApiError> {
    control.set_aggregation(id, policy)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// Error handling
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalError(String),
}

impl From<ControlError> for ApiError {
    fn from(error: ControlError) -> Self {
        match error {
            ControlError::Config(ConfigError::Validation(msg)) => ApiError::BadRequest(msg),
            ControlError::Config(ConfigError::UnknownSource(id)) => {
                ApiError::NotFound(format!("unknown source {}", id))
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
