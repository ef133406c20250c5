//! HTTP surface.
//!
//! ```text
//! GET  /sync?entityId=&entityType=                       active sessions
//! POST /sync {action, ...}                               join / leave / apply / cursor
//! GET  /templates/{id}/versions                          version history
//! GET  /templates/{id}/diff?from=&to=                    structural diff
//! POST /templates/{id}/versions/{versionId}/revert       revert (editor+)
//! GET  /health
//! ```
//!
//! Bodies are parsed by hand so malformed JSON maps to 400 like every
//! other validation failure. Errors are returned as `{"error": message}`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::SyncError;
use crate::model::{Actor, EntityType, OperationRequest, Role};
use crate::service::SyncCore;

/// Error wrapper mapping [`SyncError`] onto status codes.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self.0 {
            SyncError::Validation(m) => (StatusCode::BAD_REQUEST, m),
            SyncError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            SyncError::Permission(m) => (StatusCode::FORBIDDEN, m),
            SyncError::Conflict(m) => (StatusCode::CONFLICT, m),
            SyncError::Storage(m) => {
                log::error!("Request failed on storage: {m}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn router(core: Arc<SyncCore>) -> Router {
    Router::new()
        .route("/sync", get(get_sessions).post(post_sync))
        .route("/templates/{id}/versions", get(get_versions))
        .route("/templates/{id}/diff", get(get_diff))
        .route(
            "/templates/{id}/versions/{version_id}/revert",
            post(revert_version),
        )
        .route("/health", get(health))
        .with_state(core)
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, SyncError> {
    serde_json::from_slice(body).map_err(|e| SyncError::Validation(format!("invalid request body: {e}")))
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, SyncError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SyncError::Validation(format!("{field} is required"))),
    }
}

fn entity_type(value: &Option<String>) -> Result<Option<EntityType>, SyncError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(str::parse)
        .transpose()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsQuery {
    entity_id: Option<String>,
    entity_type: Option<String>,
}

async fn get_sessions(
    State(core): State<Arc<SyncCore>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult {
    let entity_id = required("entityId", &query.entity_id)?;
    let entity_type = entity_type(&query.entity_type)?;
    let sessions = core.sessions.get_active_sessions(entity_id, entity_type)?;
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    action: Option<String>,
    user_id: Option<String>,
    user_name: Option<String>,
    entity_id: Option<String>,
    entity_type: Option<String>,
    session_id: Option<String>,
    connection_ref: Option<String>,
    operation: Option<Value>,
    position: Option<Value>,
}

impl SyncRequest {
    fn entity_type(&self) -> Result<EntityType, SyncError> {
        entity_type(&self.entity_type)?
            .ok_or_else(|| SyncError::Validation("entityType is required".into()))
    }

    /// Build the operation, taking user and entity from the envelope when
    /// the operation object leaves them out.
    fn operation(&self) -> Result<OperationRequest, SyncError> {
        let Some(Value::Object(fields)) = &self.operation else {
            return Err(SyncError::Validation("operation is required".into()));
        };
        let mut fields: Map<String, Value> = fields.clone();
        for (key, value) in [
            ("userId", &self.user_id),
            ("entityId", &self.entity_id),
            ("entityType", &self.entity_type),
        ] {
            if let Some(v) = value {
                fields.entry(key).or_insert_with(|| Value::String(v.clone()));
            }
        }
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| SyncError::Validation(format!("invalid operation: {e}")))
    }
}

async fn post_sync(State(core): State<Arc<SyncCore>>, body: Bytes) -> ApiResult {
    let request: SyncRequest = parse_body(&body)?;
    let action = required("action", &request.action)?;

    match action {
        "join_session" => {
            let session = core
                .sessions
                .join_session(
                    required("userId", &request.user_id)?,
                    required("userName", &request.user_name)?,
                    required("entityId", &request.entity_id)?,
                    request.entity_type()?,
                    request.connection_ref.clone(),
                )
                .await?;
            Ok(Json(json!({ "session": session })))
        }
        "leave_session" => {
            core.sessions
                .leave_session(
                    required("sessionId", &request.session_id)?,
                    required("userId", &request.user_id)?,
                )
                .await?;
            Ok(Json(json!({ "success": true })))
        }
        "apply_operation" => {
            let operation = request.operation()?;
            let result = core.operations.apply_operation(&operation).await;
            Ok(Json(json!({ "result": result })))
        }
        "update_cursor" => {
            let Some(position) = request.position.clone() else {
                return Err(SyncError::Validation("position is required".into()).into());
            };
            let session = core
                .sessions
                .update_cursor(
                    required("userId", &request.user_id)?,
                    required("entityId", &request.entity_id)?,
                    request.entity_type()?,
                    position,
                )
                .await?;
            Ok(Json(json!({ "success": true, "session": session })))
        }
        other => Err(SyncError::Validation(format!("unknown action {other:?}")).into()),
    }
}

async fn get_versions(State(core): State<Arc<SyncCore>>, Path(id): Path<String>) -> ApiResult {
    let versions = core.versions.get_template_versions(&id)?;
    Ok(Json(json!({ "versions": versions })))
}

#[derive(Debug, Deserialize)]
struct DiffQuery {
    from: Option<String>,
    to: Option<String>,
}

async fn get_diff(
    State(core): State<Arc<SyncCore>>,
    Path(id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult {
    let diff = core.versions.diff_versions(
        &id,
        required("from", &query.from)?,
        required("to", &query.to)?,
    )?;
    Ok(Json(json!({ "diff": diff })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevertRequest {
    user_id: Option<String>,
    role: Option<Role>,
}

async fn revert_version(
    State(core): State<Arc<SyncCore>>,
    Path((id, version_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult {
    let request: RevertRequest = parse_body(&body)?;
    let actor = Actor::new(
        required("userId", &request.user_id)?,
        request.role.unwrap_or(Role::Viewer),
    );
    let template = core
        .templates
        .revert_to_version(&id, &version_id, &actor)
        .await?;
    let active = core.versions.get_active_version(&id)?;
    Ok(Json(json!({ "template": template, "version": active })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (SyncError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (SyncError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SyncError::Permission("x".into()), StatusCode::FORBIDDEN),
            (SyncError::Conflict("x".into()), StatusCode::CONFLICT),
            (SyncError::Storage("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError(error).into_response().status(), status);
        }
    }

    #[test]
    fn test_operation_inherits_envelope_fields() {
        let request = SyncRequest {
            user_id: Some("u1".into()),
            entity_id: Some("E1".into()),
            entity_type: Some("checklist".into()),
            operation: Some(json!({"type": "update", "path": "item.1", "newValue": true})),
            ..Default::default()
        };
        let op = request.operation().unwrap();
        assert_eq!(op.user_id, "u1");
        assert_eq!(op.entity_id, "E1");
        assert_eq!(op.entity_type, EntityType::Checklist);
    }

    #[tokio::test]
    async fn test_health() {
        use tower::ServiceExt;
        let core = Arc::new(
            SyncCore::open(
                crate::config::ServerConfig::for_testing(),
                Arc::new(crate::audit::LogAuditSink),
            )
            .unwrap(),
        );
        let response = router(core)
            .oneshot(Request::get("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
