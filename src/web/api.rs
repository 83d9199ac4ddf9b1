use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use super::server::WebState;
use crate::terminal::{SessionInfo, Target};

/// API routes
pub fn api_routes() -> Router<Arc<WebState>> {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{*id}", get(get_session))
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

async fn list_sessions(
    State(state): State<Arc<WebState>>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Vec<SessionInfo>>, StatusCode> {
    if !state.verify_token(query.token.as_deref()) {
        return Err(StatusCode::FORBIDDEN);
    }

    Ok(Json(state.session_manager.list().await))
}

async fn get_session(
    State(state): State<Arc<WebState>>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<SessionInfo>, StatusCode> {
    if !state.verify_token(query.token.as_deref()) {
        return Err(StatusCode::FORBIDDEN);
    }

    let target: Target = id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    match state.session_manager.get(&target).await {
        Some(session) => Ok(Json(session.info().await)),
        None => Err(StatusCode::NOT_FOUND),
    }
}
