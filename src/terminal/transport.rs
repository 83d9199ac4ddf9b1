use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream};

use crate::error::TransportError;

/// Frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Raw keystrokes for the terminal.
    Input(Bytes),
    /// Structured control message (JSON text).
    Control(String),
    /// Peer initiated close.
    Close,
}

/// Frame sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Raw process output.
    Output(Bytes),
    /// Human-readable error, sent before closing a rejected connection.
    Error(String),
}

pub type OutboundSink = Pin<Box<dyn Sink<Outbound, Error = TransportError> + Send>>;
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Inbound, TransportError>> + Send>>;

/// A duplex client connection, split into its two halves.
///
/// The session keeps the sink while the connection is attached; the
/// handoff loop owns the stream.
pub struct Transport {
    pub sink: OutboundSink,
    pub stream: InboundStream,
}

impl Transport {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Outbound, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Inbound, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Tell the client why it cannot be served, then close.
    pub async fn reject(mut self, message: String) {
        if let Err(e) = self.sink.send(Outbound::Error(message)).await {
            tracing::debug!(error = %e, "Failed to deliver rejection");
        }
        let _ = self.sink.close().await;
    }
}
