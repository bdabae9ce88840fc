//! REST surface of the alerting monitor.
//!
//! The API is a thin translation layer: requests are tenant-scoped through
//! the `ActiveProjectID` header, authorised with a bearer JWT, validated,
//! and handed to the store. Mutations answer `204`; the actual push to the
//! downstream systems happens asynchronously in the executor.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use monitor_core::{
    auth::{AccessTokenVerifier, TenantDirectory},
    DefinitionDetails, DefinitionValues, EmailAddress, ErrorKind, ReceiverDetails,
};
use monitor_store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub mod config;

pub const TENANT_HEADER: &str = "ActiveProjectID";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub verifier: AccessTokenVerifier,
    pub directory: Arc<dyn TenantDirectory>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &self.store)
            .field("verifier", &self.verifier)
            .field("directory", &"<TenantDirectory>")
            .finish()
    }
}

pub fn router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/status", get(status))
        .route("/alerts", get(list_alerts))
        .route("/alerts/definitions", get(list_definitions))
        .route(
            "/alerts/definitions/:id",
            get(get_definition).patch(patch_definition),
        )
        .route("/alerts/definitions/:id/template", get(get_template))
        .route("/alerts/receivers", get(list_receivers))
        .route(
            "/alerts/receivers/:id",
            get(get_receiver).patch(patch_receiver),
        )
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Responses

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionResponse {
    pub id: Uuid,
    pub name: String,
    pub state: String,
    pub category: String,
    pub context: String,
    pub severity: String,
    pub alert_interval: i64,
    pub enabled: bool,
    pub version: i64,
    pub values: DefinitionValuesResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionValuesResponse {
    pub duration: String,
    pub duration_min: String,
    pub duration_max: String,
    pub threshold: i64,
    pub threshold_min: i64,
    pub threshold_max: i64,
}

impl From<DefinitionDetails> for DefinitionResponse {
    fn from(definition: DefinitionDetails) -> Self {
        Self {
            id: definition.uuid,
            name: definition.name,
            state: definition.state.as_str().to_string(),
            category: definition.category.as_str().to_string(),
            context: definition.context,
            severity: definition.severity,
            alert_interval: definition.alert_interval,
            enabled: definition.enabled,
            version: definition.version,
            values: DefinitionValuesResponse {
                duration: format!("{}s", definition.duration.value),
                duration_min: format!("{}s", definition.duration.min),
                duration_max: format!("{}s", definition.duration.max),
                threshold: definition.threshold.value,
                threshold_min: definition.threshold.min,
                threshold_max: definition.threshold.max,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverResponse {
    pub id: Uuid,
    pub name: String,
    pub state: String,
    pub version: i64,
    pub email_config: EmailConfigResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfigResponse {
    pub mail_server: String,
    pub from: String,
    pub to: Vec<String>,
}

impl From<ReceiverDetails> for ReceiverResponse {
    fn from(receiver: ReceiverDetails) -> Self {
        Self {
            id: receiver.uuid,
            name: receiver.name,
            state: receiver.state.as_str().to_string(),
            version: receiver.version,
            email_config: EmailConfigResponse {
                mail_server: receiver.mail_server,
                from: receiver.from.to_string(),
                to: receiver.to.iter().map(EmailAddress::to_string).collect(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub definitions: Vec<DefinitionResponse>,
    pub receivers: Vec<ReceiverResponse>,
}

#[derive(Debug, Serialize)]
pub struct TemplateResponse {
    pub template: String,
}

// ---------------------------------------------------------------------------
// Requests

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchDefinitionRequest {
    values: PatchDefinitionValues,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchDefinitionValues {
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    threshold: Option<String>,
    #[serde(default)]
    enabled: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PatchReceiverRequest {
    to: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateQuery {
    #[serde(default)]
    rendered: Option<bool>,
}

// ---------------------------------------------------------------------------
// Handlers

async fn status(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    sqlx::query("SELECT 1")
        .execute(state.store.pool())
        .await
        .map_err(|err| {
            tracing::warn!(
                event = "monitor.api.status.db_unreachable",
                error = %err,
                "status probe failed"
            );
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        })?;

    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<AlertsResponse>> {
    let tenant = authorize(&state, &headers)?;
    let definitions = state.store.get_definitions(&tenant).await?;
    let receivers = state.store.get_receivers(&tenant).await?;
    Ok(Json(AlertsResponse {
        definitions: definitions.into_iter().map(Into::into).collect(),
        receivers: receivers.into_iter().map(Into::into).collect(),
    }))
}

async fn list_definitions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<DefinitionResponse>>> {
    let tenant = authorize(&state, &headers)?;
    let definitions = state.store.get_definitions(&tenant).await?;
    Ok(Json(definitions.into_iter().map(Into::into).collect()))
}

async fn get_definition(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DefinitionResponse>> {
    let tenant = authorize(&state, &headers)?;
    let uuid = parse_uuid(&id)?;
    let definition = state.store.get_latest_definition(&tenant, uuid).await?;
    Ok(Json(definition.into()))
}

async fn patch_definition(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let uuid = parse_uuid(&id)?;
    let request: PatchDefinitionRequest = parse_json(&body)?;

    let values = DefinitionValues {
        duration: request
            .values
            .duration
            .as_deref()
            .map(parse_patch_duration)
            .transpose()?,
        threshold: request
            .values
            .threshold
            .as_deref()
            .map(parse_patch_threshold)
            .transpose()?,
        enabled: request
            .values
            .enabled
            .as_deref()
            .map(parse_patch_enabled)
            .transpose()?,
    };
    if values.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "empty patch"));
    }

    state
        .store
        .set_definition_values(&tenant, uuid, &values)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<TemplateQuery>,
) -> ApiResult<Json<TemplateResponse>> {
    let tenant = authorize(&state, &headers)?;
    let uuid = parse_uuid(&id)?;
    let definition = state.store.get_latest_definition(&tenant, uuid).await?;

    let template = if query.rendered.unwrap_or(false) {
        monitor_core::template::render(
            &definition.template,
            definition.duration.value,
            definition.threshold.value,
        )
    } else {
        definition.template
    };
    Ok(Json(TemplateResponse { template }))
}

async fn list_receivers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ReceiverResponse>>> {
    let tenant = authorize(&state, &headers)?;
    let receivers = state.store.get_receivers(&tenant).await?;
    Ok(Json(receivers.into_iter().map(Into::into).collect()))
}

async fn get_receiver(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ReceiverResponse>> {
    let tenant = authorize(&state, &headers)?;
    let uuid = parse_uuid(&id)?;
    let receiver = state.store.get_latest_receiver(&tenant, uuid).await?;
    Ok(Json(receiver.into()))
}

async fn patch_receiver(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let tenant = authorize(&state, &headers)?;
    let uuid = parse_uuid(&id)?;
    let request: PatchReceiverRequest = parse_json(&body)?;

    let recipients = request
        .to
        .iter()
        .map(|entry| EmailAddress::parse(entry).map_err(ApiError::from))
        .collect::<Result<Vec<_>, _>>()?;

    state
        .store
        .set_receiver_recipients(&tenant, uuid, &recipients)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Validation

fn tenant_from_headers(headers: &HeaderMap) -> Result<String, ApiError> {
    let tenant = headers
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if tenant.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "missing ActiveProjectID header",
        ));
    }
    Ok(tenant.to_string())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let tenant = tenant_from_headers(headers)?;

    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing bearer token"))?;

    let claims = state.verifier.verify(token).map_err(|err| {
        tracing::warn!(
            event = "monitor.api.token.invalid",
            error = %err,
            "invalid access token"
        );
        ApiError::new(StatusCode::UNAUTHORIZED, "invalid access token")
    })?;

    if !state.directory.is_member(&claims, &tenant) {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "tenant not authorized",
        ));
    }
    Ok(tenant)
}

fn parse_uuid(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid entity id"))
}

/// Strict JSON parsing: malformed payloads and unknown fields are client
/// errors, not 422s.
fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        ApiError::with_message(StatusCode::BAD_REQUEST, format!("invalid payload: {err}"))
    })
}

/// `"<n>s"`, positive, whole seconds.
fn parse_patch_duration(value: &str) -> Result<i64, ApiError> {
    let seconds = value
        .strip_suffix('s')
        .and_then(|number| number.parse::<i64>().ok())
        .filter(|seconds| *seconds > 0)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid duration"))?;
    Ok(seconds)
}

fn parse_patch_threshold(value: &str) -> Result<i64, ApiError> {
    value
        .parse::<i64>()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid threshold"))
}

fn parse_patch_enabled(value: &str) -> Result<bool, ApiError> {
    value
        .parse::<bool>()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid enabled flag"))
}

// ---------------------------------------------------------------------------
// Errors

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    fn with_message(status: StatusCode, message: String) -> Self {
        Self { status, message }
    }
}

impl From<monitor_core::Error> for ApiError {
    fn from(err: monitor_core::Error) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::with_message(StatusCode::NOT_FOUND, err.to_string()),
            ErrorKind::ValueOutOfBounds | ErrorKind::BadRequest => {
                Self::with_message(StatusCode::BAD_REQUEST, err.to_string())
            }
            ErrorKind::Unauthorized => {
                Self::with_message(StatusCode::UNAUTHORIZED, err.to_string())
            }
            ErrorKind::DependencyUnavailable | ErrorKind::Internal => {
                tracing::error!(
                    event = "monitor.api.internal_error",
                    error = %err,
                    "api internal error"
                );
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
