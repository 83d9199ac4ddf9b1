use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::terminal::SessionManager;

/// Session registry and access token, handed to every route
pub struct WebState {
    pub session_manager: Arc<SessionManager>,
    pub token: String,
}

impl WebState {
    /// Whether the `token` query parameter matches the configured token
    pub fn verify_token(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| t == self.token)
    }
}

/// Terminal WebSocket and session-listing routes, with request tracing
pub fn create_router(state: Arc<WebState>) -> Router {
    Router::new()
        .merge(super::api::api_routes())
        .merge(super::websocket::ws_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `host:port` and serve terminals until the listener fails
pub async fn start_web_server(
    host: &str,
    port: u16,
    session_manager: Arc<SessionManager>,
    token: String,
) -> Result<()> {
    let state = Arc::new(WebState {
        session_manager,
        token,
    });

    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(addr = %addr, "Web server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
