use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::QuerySetError;
use crate::exec::ExecResult;
use crate::interface::QueryInterface;
use crate::query::Set;
use crate::regexdef::RegexDef;
use crate::substitute::Vars;
use crate::view::ViewParams;

type Shared = State<Arc<QueryInterface>>;

/// An error on its way to the caller as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub StatusCode, pub String);

impl From<QuerySetError> for ApiError {
    fn from(e: QuerySetError) -> Self {
        let status = match &e {
            QuerySetError::NotFound(_) => StatusCode::NOT_FOUND,
            QuerySetError::Parse { .. } | QuerySetError::Literal { .. } => StatusCode::BAD_REQUEST,
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, message) = self;
        warn!(%message, code = %status.as_u16(), "request failed");
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Deserialize, Default)]
pub struct ListParams {
    #[serde(default)]
    pub names: bool,
}

// Store and engine calls are synchronous, so they run on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> crate::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| {
            warn!(error = %e, "Join error");
            ApiError(StatusCode::INTERNAL_SERVER_ERROR, "Join error".to_string())
        })?
        .map_err(ApiError::from)
}

fn body<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|e| ApiError(StatusCode::BAD_REQUEST, format!("malformed body: {e}")))
}

async fn timed_exec<F>(label: String, work: F) -> Result<Json<ExecResult>, ApiError>
where
    F: FnOnce() -> crate::Result<ExecResult> + Send + 'static,
{
    let started = std::time::Instant::now();
    let result = blocking(work).await?;
    let ms = started.elapsed().as_secs_f64() * 1000.0;
    info!(set = %label, ms, error = result.is_error(), "exec complete");
    Ok(Json(result))
}

async fn list_sets(State(iface): Shared, Query(params): Query<ListParams>) -> Result<Response, ApiError> {
    let listing = blocking(move || iface.list_sets(params.names, None)).await?;
    Ok(Json(listing).into_response())
}

async fn get_set(State(iface): Shared, Path(name): Path<String>) -> Result<Json<Set>, ApiError> {
    Ok(Json(blocking(move || iface.get_set(&name)).await?))
}

async fn upsert_set(State(iface): Shared, bytes: Bytes) -> Result<StatusCode, ApiError> {
    let set: Set = body(&bytes)?;
    blocking(move || iface.upsert_set(&set)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_set(State(iface): Shared, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    blocking(move || iface.delete_set(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ensure_indexes(State(iface): Shared, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    blocking(move || iface.ensure_indexes(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn exec_name(
    State(iface): Shared,
    Path(name): Path<String>,
    Query(vars): Query<Vars>,
) -> Result<Json<ExecResult>, ApiError> {
    timed_exec(name.clone(), move || iface.exec_name(&name, &vars)).await
}

async fn exec_inline(
    State(iface): Shared,
    Query(vars): Query<Vars>,
    bytes: Bytes,
) -> Result<Json<ExecResult>, ApiError> {
    let set: Set = body(&bytes)?;
    timed_exec(set.name.clone(), move || iface.exec_set(&set, &vars)).await
}

async fn exec_name_on_view(
    State(iface): Shared,
    Path((name, view, item)): Path<(String, String, String)>,
    Query(vars): Query<Vars>,
) -> Result<Json<ExecResult>, ApiError> {
    let params = ViewParams { view_name: view, item_key: item, results_collection: None };
    timed_exec(name.clone(), move || iface.exec_name_on_view(&name, &params, &vars)).await
}

async fn exec_inline_on_view(
    State(iface): Shared,
    Path((view, item)): Path<(String, String)>,
    Query(vars): Query<Vars>,
    bytes: Bytes,
) -> Result<Json<ExecResult>, ApiError> {
    let set: Set = body(&bytes)?;
    let params = ViewParams { view_name: view, item_key: item, results_collection: None };
    timed_exec(set.name.clone(), move || iface.exec_set_on_view(&set, &params, &vars)).await
}

async fn list_regexes(State(iface): Shared, Query(params): Query<ListParams>) -> Result<Response, ApiError> {
    let listing = blocking(move || iface.list_regexes(params.names, None)).await?;
    Ok(Json(listing).into_response())
}

async fn get_regex(State(iface): Shared, Path(name): Path<String>) -> Result<Json<RegexDef>, ApiError> {
    Ok(Json(blocking(move || iface.get_regex(&name)).await?))
}

async fn upsert_regex(State(iface): Shared, bytes: Bytes) -> Result<StatusCode, ApiError> {
    let def: RegexDef = body(&bytes)?;
    blocking(move || iface.upsert_regex(&def)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_regex(State(iface): Shared, Path(name): Path<String>) -> Result<StatusCode, ApiError> {
    blocking(move || iface.delete_regex(&name)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(interface: Arc<QueryInterface>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE])
        .allow_headers(Any);
    Router::new()
        .route("/v1/query", get(list_sets).put(upsert_set))
        .route("/v1/query/:name", get(get_set).delete(delete_set))
        .route("/v1/index/:name", put(ensure_indexes))
        .route("/v1/exec", post(exec_inline))
        .route("/v1/exec/:name", get(exec_name))
        .route("/v1/exec/:name/view/:view/:item", get(exec_name_on_view))
        .route("/v1/exec/view/:view/:item", post(exec_inline_on_view))
        .route("/v1/regex", get(list_regexes).put(upsert_regex))
        .route("/v1/regex/:name", get(get_regex).delete(delete_regex))
        .layer(cors)
        .with_state(interface)
}
