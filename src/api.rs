use crate::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        .route("/connections", get(list_connections))
        .route(
            "/connections/{id}",
            get(get_connection).delete(kill_connection),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_api_server(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Management API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    match state.config.api_key() {
        None => Ok(()),
        Some(expected) => {
            let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
            if provided == Some(expected) {
                Ok(())
            } else {
                Err(StatusCode::UNAUTHORIZED)
            }
        }
    }
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "mysql-wire-server",
        "version": env!("CARGO_PKG_VERSION"),
        "active_connections": state.sessions.len(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics_handle
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_connections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let connections = state.sessions.list().await;
    Ok(Json(json!({
        "active_connections": connections.len(),
        "connections": connections,
    })))
}

async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    let handle = state.sessions.get(id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!(handle.snapshot().await)))
}

async fn kill_connection(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    authorize(&state, &headers)?;
    if state.sessions.kill(id).await {
        Ok(Json(json!({ "status": "killed", "connection_id": id })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
