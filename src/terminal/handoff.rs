use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;

use crate::error::SpawnError;

use super::transport::{Inbound, Transport};
use super::{Session, SessionManager, Target};

/// Structured message carried in a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

impl ControlMessage {
    /// Parse a text frame. Anything malformed or unknown is `None`.
    pub fn parse(text: &str) -> Option<Self> {
        let msg: ControlMessage = serde_json::from_str(text).ok()?;
        match msg {
            ControlMessage::Resize { cols, rows } if cols == 0 || rows == 0 => None,
            msg => Some(msg),
        }
    }
}

/// A connection that could not be served. The transport is handed back
/// untouched so the caller can tell the client and close it.
pub struct ServeError {
    pub error: SpawnError,
    pub transport: Transport,
}

/// Find or create the session for `target` and hand `transport` over to it.
/// Returns once the transport is closed or superseded.
pub async fn serve_connection(
    manager: &Arc<SessionManager>,
    transport: Transport,
    target: &Target,
) -> Result<(), ServeError> {
    match manager.get_or_create(target).await {
        Ok(session) => {
            handoff(&session, transport).await;
            Ok(())
        }
        Err(error) => Err(ServeError { error, transport }),
    }
}

/// Attach `transport` to `session`, replacing any previous one, and pump its
/// inbound frames into the pty until it ends.
pub async fn handoff(session: &Session, transport: Transport) {
    let Transport { sink, mut stream } = transport;
    let attachment = session.attach(sink).await;
    let conn = attachment.seq();

    loop {
        let frame = tokio::select! {
            _ = attachment.superseded() => {
                tracing::debug!(session = %session.id(), conn = conn, "Superseded by newer transport");
                break;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Inbound::Input(data))) => {
                if let Err(e) = session.write_input(&data).await {
                    tracing::debug!(session = %session.id(), conn = conn, error = %e, "PTY write failed");
                }
            }
            Some(Ok(Inbound::Control(text))) => {
                if let Some(ControlMessage::Resize { cols, rows }) = ControlMessage::parse(&text) {
                    tracing::debug!(session = %session.id(), conn = conn, cols = cols, rows = rows, "Resize");
                    if let Err(e) = session.resize(cols, rows).await {
                        tracing::debug!(session = %session.id(), conn = conn, error = %e, "Resize failed");
                    }
                }
            }
            Some(Ok(Inbound::Close)) | None => break,
            Some(Err(e)) => {
                tracing::debug!(session = %session.id(), conn = conn, error = %e, "Transport read failed");
                break;
            }
        }
    }

    let was_active = session.detach(&attachment).await;
    tracing::info!(
        session = %session.id(),
        seq = session.seq(),
        conn = conn,
        was_active = was_active,
        "Transport detached"
    );
}
