use std::future;
use std::sync::Arc;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};

use super::api::TokenQuery;
use super::server::WebState;
use crate::error::TransportError;
use crate::terminal::{serve_connection, Inbound, Outbound, ServeError, Target, Transport};

pub fn ws_routes() -> Router<Arc<WebState>> {
    // The wildcard keeps ids like "lxc/pve/100" in one piece.
    Router::new().route("/ws/terminal/{*id}", get(ws_handler))
}

async fn ws_handler(
    State(state): State<Arc<WebState>>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.verify_token(query.token.as_deref()) {
        return StatusCode::FORBIDDEN.into_response();
    }

    // Reject before anything is upgraded or spawned
    let target: Target = match id.parse() {
        Ok(target) => target,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected terminal request");
            return (StatusCode::BAD_REQUEST, "invalid terminal id").into_response();
        }
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, target))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<WebState>, target: Target) {
    tracing::info!(session = %target, "WebSocket connected");

    let transport = into_transport(socket);
    if let Err(ServeError { error, transport }) =
        serve_connection(&state.session_manager, transport, &target).await
    {
        tracing::error!(session = %target, error = %error, "Cannot serve terminal");
        transport.reject(format!("Error: {}", error)).await;
    }

    tracing::info!(session = %target, "WebSocket disconnected");
}

/// Adapt a WebSocket to the terminal transport: binary frames carry
/// terminal bytes both ways, text frames carry control messages in and
/// error notices out. Ping/pong stays inside axum.
fn into_transport(socket: WebSocket) -> Transport {
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::new(e))
        .with(|frame: Outbound| {
            future::ready(Ok::<_, TransportError>(match frame {
                Outbound::Output(data) => Message::Binary(data),
                Outbound::Error(msg) => Message::Text(msg.into()),
            }))
        });

    let stream = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(Message::Binary(data)) => Some(Ok(Inbound::Input(data))),
            Ok(Message::Text(text)) => Some(Ok(Inbound::Control(text.as_str().to_owned()))),
            Ok(Message::Close(_)) => Some(Ok(Inbound::Close)),
            Ok(_) => None,
            Err(e) => Some(Err(TransportError::new(e))),
        })
    });

    Transport::new(sink, stream)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    use super::*;
    use crate::terminal::{CommandSource, SessionManager, ShellCommand};

    struct Script(&'static str);

    impl CommandSource for Script {
        fn command_for(&self, _target: &Target) -> ShellCommand {
            ShellCommand::new("/bin/sh", vec!["-c".into(), self.0.into()])
        }
    }

    const ECHO: &str = "stty -echo; while read l; do printf '[%s]' \"$l\"; done";

    fn state(commands: impl CommandSource + 'static) -> Arc<WebState> {
        Arc::new(WebState {
            session_manager: Arc::new(SessionManager::new(commands)),
            token: "secret".into(),
        })
    }

    /// Status for a well-formed upgrade request that never gets upgraded.
    async fn status(uri: &str) -> StatusCode {
        let req = Request::get(uri)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap();
        crate::web::create_router(state(Script(ECHO)))
            .oneshot(req)
            .await
            .unwrap()
            .status()
    }

    async fn serve(state: Arc<WebState>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, crate::web::create_router(state))
                .await
                .unwrap();
        });
        addr
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn connect(addr: std::net::SocketAddr, id: &str) -> Client {
        let url = format!("ws://{}/ws/terminal/{}?token=secret", addr, id);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    /// Read frames until the accumulated text contains `needle`.
    /// `None` if the connection ends first.
    async fn read_until(ws: &mut Client, needle: &str) -> Option<String> {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match ws.next().await? {
                Ok(WsMessage::Binary(data)) => seen.push_str(&String::from_utf8_lossy(&data)),
                Ok(WsMessage::Text(text)) => seen.push_str(text.as_str()),
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        Some(seen)
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        assert_eq!(status("/ws/terminal/host").await, StatusCode::FORBIDDEN);
        assert_eq!(
            status("/ws/terminal/host?token=wrong").await,
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_id_before_upgrade() {
        assert_eq!(
            status("/ws/terminal/lxc/pve?token=secret").await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status("/ws/terminal/node:a%3Bb?token=secret").await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status("/ws/terminal/abc?token=secret").await,
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_valid_id_passes_validation() {
        // Passes validation and only fails for lack of a real connection
        assert_eq!(
            status("/ws/terminal/lxc/pve/100?token=secret").await,
            StatusCode::UPGRADE_REQUIRED
        );
    }

    #[tokio::test]
    async fn test_websocket_terminal_session() {
        let state = state(Script(ECHO));
        let addr = serve(state.clone()).await;

        let mut ws = connect(addr, "lxc/pve/100").await;
        ws.send(WsMessage::text(r#"{"type":"resize","cols":132,"rows":50}"#))
            .await
            .unwrap();
        ws.send(WsMessage::binary(b"hello\n".to_vec())).await.unwrap();
        assert!(read_until(&mut ws, "[hello]").await.is_some());

        let target: Target = "lxc/pve/100".parse().unwrap();
        let session = state.session_manager.get(&target).await.unwrap();
        assert_eq!(session.size().unwrap(), (132, 50));
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_socket() {
        let state = state(Script(ECHO));
        let addr = serve(state.clone()).await;

        let mut first = connect(addr, "host").await;
        first.send(WsMessage::binary(b"a\n".to_vec())).await.unwrap();
        assert!(read_until(&mut first, "[a]").await.is_some());

        let mut second = connect(addr, "host").await;
        second.send(WsMessage::binary(b"b\n".to_vec())).await.unwrap();
        assert!(read_until(&mut second, "[b]").await.is_some());

        // The first client only sees its socket close
        let ended = tokio::time::timeout(Duration::from_secs(5), read_until(&mut first, "[b]"))
            .await
            .unwrap();
        assert!(ended.is_none());
        assert_eq!(state.session_manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error() {
        struct Missing;
        impl CommandSource for Missing {
            fn command_for(&self, _target: &Target) -> ShellCommand {
                ShellCommand::new("/nonexistent/termbridge-test", vec![])
            }
        }
        let addr = serve(state(Missing)).await;

        let mut ws = connect(addr, "host").await;
        let msg = read_until(&mut ws, "Error:").await.unwrap();
        assert!(msg.contains("/nonexistent/termbridge-test"));
    }
}
