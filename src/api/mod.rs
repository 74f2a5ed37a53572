pub mod auth;
pub mod stream;


use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::dispatcher::{Dispatcher, DispatcherStatus, Envelope};
use crate::error::{RelayError, Result};

#[derive(Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DispatchQuery {
    #[serde(default)]
    notify: bool,
}

pub fn create_router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/dispatch", post(dispatch))
        .route("/status", get(get_status))
        .route("/store/:key", get(get_store_key))
        .route("/stream/:key", get(stream::stream_key))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the UI-facing surface until `shutdown` resolves.
pub async fn start_api_server<F>(dispatcher: Dispatcher, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(ApiState {
        dispatcher,
        token: config.token.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Network(format!("Could not bind {}: {}", addr, e)))?;
    info!("API server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    info!("API server stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

/// The `{callback, payload}` endpoint. Unknown callbacks get an empty 204.
async fn dispatch(
    State(state): State<ApiState>,
    Query(query): Query<DispatchQuery>,
    Json(envelope): Json<Envelope>,
) -> Response {
    if query.notify {
        return if state.dispatcher.notify(envelope) {
            StatusCode::ACCEPTED.into_response()
        } else {
            StatusCode::NO_CONTENT.into_response()
        };
    }

    let callback = envelope.callback.clone();
    match state.dispatcher.call(envelope).await {
        Some(response) => Json(response).into_response(),
        None => {
            debug!("Ignored unknown callback {}", callback);
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

async fn get_status(State(state): State<ApiState>) -> Json<ApiResponse<DispatcherStatus>> {
    Json(ApiResponse::success(state.dispatcher.status()))
}

async fn get_store_key(State(state): State<ApiState>, Path(key): Path<String>) -> (StatusCode, Json<ApiResponse<Value>>) {
    match state.dispatcher.store().get(&key).await {
        Some(value) => (StatusCode::OK, Json(ApiResponse::success(value))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No value stored under {}", key))),
        ),
    }
}
