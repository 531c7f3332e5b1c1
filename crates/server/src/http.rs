use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};

use arkiv_auth::{TokenConfig, TokenValidator};
use arkiv_model::{ArchiveFilter, ArchiveRecordInput, FilterError, expand_batch};
use arkiv_store::{ArchiveStore, StoreError, StoreSettings};

use crate::config::{ServerConfig, StartupError};
use crate::credentials;

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: ArchiveStore,
    pub validator: TokenValidator,
    pub alive: Arc<AtomicBool>,
}

/// Wires the full application state. Loads mounted credentials when
/// configured, resolves the token issuer, then connects the pool and runs
/// migrations. Any failure here is a startup failure.
pub async fn build_state(config: ServerConfig) -> Result<AppState, StartupError> {
    let mut username = None;
    let mut password = None;
    if let (Some(mount_path), Some(db_name)) = (&config.mount_path, &config.db_name) {
        let creds = credentials::load_db_credentials(mount_path, db_name).await?;
        username = Some(creds.username);
        password = Some(creds.password);
    }

    let validator = TokenValidator::discover(TokenConfig {
        well_known_url: config.well_known_url.clone(),
        audiences: config.audiences.clone(),
        jwks_timeout: arkiv_auth::DEFAULT_JWKS_TIMEOUT,
        jwks_refresh_ttl: arkiv_auth::DEFAULT_JWKS_REFRESH_TTL,
        clock_skew: arkiv_auth::DEFAULT_CLOCK_SKEW,
    })
    .await
    .map_err(|err| StartupError {
        code: err.code,
        message: err.message,
    })?;
    tracing::info!(issuer = validator.issuer(), "token issuer resolved");

    let store = ArchiveStore::connect_and_migrate(
        StoreSettings {
            db_url: config.db_url.clone(),
            username,
            password,
            tables: config.tables.clone(),
        },
        Duration::from_millis(config.db_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to initialize archive store: {err}"),
    })?;

    Ok(AppState {
        config,
        store,
        validator,
        alive: Arc::new(AtomicBool::new(true)),
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/arkiv", post(archive))
        .route("/hente", post(fetch))
        .route("/authping", get(authping))
        .route("/internal/is_alive", get(is_alive))
        .route("/internal/is_ready", get(is_ready))
        .route("/internal/prometheus", get(prometheus))
        .with_state(state)
}

async fn archive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Vec<ArchiveRecordInput>>, JsonRejection>,
) -> Response {
    crate::metrics::inc_archive_request();

    let Json(records) = match body {
        Ok(json) => json,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                "Request body is not a valid archive batch",
            )
                .into_response();
        }
    };

    let bypass = state.config.dev_mode && records.first().is_some_and(|r| r.source == "test");
    if !bypass && let Err(err) = state.validator.validate_headers(&headers).await {
        tracing::warn!(code = err.code, "archive request denied");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let writes = match expand_batch(&records) {
        Ok(writes) => writes,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    match state.store.add_archive(&writes).await {
        Ok(receipts) => {
            if let Some(last) = receipts.last() {
                crate::metrics::observe_inserted(receipts.len() as u64, last.id);
            }
            tracing::info!(
                records = records.len(),
                rows = receipts.len(),
                "archived batch"
            );
            (StatusCode::CREATED, Json(receipts)).into_response()
        }
        Err(err) => store_failure("archive", &err),
    }
}

async fn fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ArchiveFilter>, JsonRejection>,
) -> Response {
    crate::metrics::inc_fetch_request();

    let Json(filter) = match body {
        Ok(json) => json,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                "Request body is not a valid archive filter",
            )
                .into_response();
        }
    };

    let bypass = state.config.dev_mode && filter.source == "test";
    if !bypass && let Err(err) = state.validator.validate_headers(&headers).await {
        tracing::warn!(code = err.code, "fetch request denied");
        return (
            StatusCode::UNAUTHORIZED,
            "Hente call denied - missing valid token",
        )
            .into_response();
    }

    let query = match filter.to_query() {
        Ok(query) => query,
        Err(FilterError::Validation(err)) => {
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
        Err(err @ FilterError::InvalidId { .. }) => {
            crate::metrics::inc_issue();
            tracing::error!(%err, "fetch filter rejected");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    match state.store.fetch_archive(&query).await {
        Ok(records) => {
            tracing::info!(rows = records.len(), "fetched archive records");
            (StatusCode::OK, Json(records)).into_response()
        }
        Err(err) => store_failure("fetch", &err),
    }
}

/// Diagnostic endpoint: reports whether the request would pass token
/// validation without touching the archive.
async fn authping(State(state): State<AppState>, headers: HeaderMap) -> String {
    let ok = state.validator.validate_headers(&headers).await.is_ok();
    format!("Auth: {ok}")
}

async fn is_alive(State(state): State<AppState>) -> Response {
    if state.alive.load(Ordering::SeqCst) {
        (StatusCode::OK, "alive").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
    }
}

async fn is_ready(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(err) => {
            tracing::warn!(%err, "readiness probe failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        }
    }
}

async fn prometheus() -> Response {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn store_failure(operation: &'static str, err: &StoreError) -> Response {
    crate::metrics::inc_issue();
    if err.is_transient() {
        tracing::warn!(%err, operation, "transient store failure");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Caught transient connection failure, message: {err}"),
        )
            .into_response()
    } else {
        tracing::error!(%err, operation, "store failure");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transient_store_failure_maps_to_503_with_diagnostic() {
        let response = store_failure("archive", &StoreError::Timeout);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("read body");
        let text = String::from_utf8(body.to_vec()).expect("utf8 body");
        assert!(text.starts_with("Caught transient connection failure, message:"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_store_failure_maps_to_500() {
        let err = StoreError::Misconfigured("bad table".to_string());
        let response = store_failure("fetch", &err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("read body");
        assert_eq!(body.as_ref(), b"Internal server error");
    }
}
