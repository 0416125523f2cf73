//! Injectable push-stream transport.
//!
//! The engine never talks to the network directly. It asks an
//! [`EventSource`] for a fresh [`EventStream`] on every (re)connect,
//! reads items until the stream errors or ends, and closes the
//! connection by dropping the stream. Tests substitute
//! [`ChannelSource`](crate::testing::ChannelSource) to script arbitrary
//! open/message/error sequences.

use async_trait::async_trait;
use futures::stream::BoxStream;

/// One item read from an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A change notification payload, still undecoded.
    Message(String),
    /// Transport-level keep-alive (SSE comment, WebSocket ping).
    Heartbeat,
}

/// A live connection. Dropping it closes the underlying transport.
pub type EventStream = BoxStream<'static, Result<SourceEvent, SourceError>>;

/// A transport capable of opening push-event connections.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new connection.
    ///
    /// Resolving `Ok` is the open signal: the server accepted the
    /// subscription and will push notifications on the returned stream.
    async fn connect(&self) -> Result<EventStream, SourceError>;

    /// Human-readable endpoint, for logs.
    fn describe(&self) -> String;
}

/// Errors raised while opening or reading a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// The connection could not be established.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The server answered the subscription request with a non-2xx status.
    #[error("Event stream rejected ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// Obtaining a stream ticket failed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An established connection failed mid-stream.
    #[error("Transport error: {0}")]
    Transport(String),
}
