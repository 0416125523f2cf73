//! Network implementations of [`EventSource`].
//!
//! [`SseSource`] subscribes to the backend's `text/event-stream`
//! endpoint over HTTP(S), optionally exchanging a bearer token for a
//! short-lived stream ticket first. [`WsSource`] reads the same JSON
//! notifications from WebSocket text frames.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use flowsync_core::wire::SSE_EVENT_MESSAGE;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{SyncConfig, Transport};
use crate::source::{EventSource, EventStream, SourceError, SourceEvent};
use crate::sse::{SseDecoder, SseFrame};

/// Build the transport selected by `config`.
pub fn from_config(config: &SyncConfig) -> Arc<dyn EventSource> {
    match config.transport {
        Transport::Sse => {
            let mut source = SseSource::new(config.endpoint.clone());
            if let Some(auth) = config.ticket_auth.clone() {
                source = source.with_ticket_auth(auth);
            }
            Arc::new(source)
        }
        Transport::WebSocket => Arc::new(WsSource::new(config.endpoint.clone())),
    }
}

// ---------------------------------------------------------------------------
// Server-sent events
// ---------------------------------------------------------------------------

/// Credentials for the stream ticket exchange.
///
/// The backend does not accept bearer tokens on the stream endpoint
/// itself; clients `POST` the ticket URL with their token and pass the
/// returned ticket as the `token` query parameter.
#[derive(Clone)]
pub struct TicketAuth {
    pub ticket_url: String,
    pub bearer_token: String,
}

impl fmt::Debug for TicketAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketAuth")
            .field("ticket_url", &self.ticket_url)
            .field("bearer_token", &"<redacted>")
            .finish()
    }
}

/// Response of the ticket endpoint.
#[derive(Debug, Deserialize)]
struct TicketResponse {
    ticket: String,
}

/// HTTP client for a server-sent event stream.
pub struct SseSource {
    client: reqwest::Client,
    endpoint: String,
    auth: Option<TicketAuth>,
}

impl SseSource {
    /// * `endpoint` - stream URL, e.g. `http://host:8000/api/v1/sse/events`.
    pub fn new(endpoint: String) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, endpoint: String) -> Self {
        Self {
            client,
            endpoint,
            auth: None,
        }
    }

    pub fn with_ticket_auth(mut self, auth: TicketAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch_ticket(&self, auth: &TicketAuth) -> Result<String, SourceError> {
        let response = self
            .client
            .post(&auth.ticket_url)
            .bearer_auth(&auth.bearer_token)
            .send()
            .await
            .map_err(|e| SourceError::Auth(format!("Ticket request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SourceError::Auth(format!(
                "Ticket endpoint returned {}: {body}",
                status.as_u16()
            )));
        }

        let ticket: TicketResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("Invalid ticket response: {e}")))?;
        Ok(ticket.ticket)
    }
}

#[async_trait]
impl EventSource for SseSource {
    async fn connect(&self) -> Result<EventStream, SourceError> {
        let mut request = self
            .client
            .get(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        if let Some(auth) = &self.auth {
            let ticket = self.fetch_ticket(auth).await?;
            request = request.query(&[("token", ticket)]);
        }

        let response = request.send().await.map_err(|e| {
            SourceError::Connect(format!("Failed to connect to {}: {e}", self.endpoint))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SourceError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let session_id = uuid::Uuid::new_v4();
        tracing::info!(
            endpoint = %self.endpoint,
            session_id = %session_id,
            "Event stream opened",
        );

        Ok(sse_stream(Box::pin(response.bytes_stream())))
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Turn a byte stream carrying an event-stream body into an [`EventStream`].
///
/// Ends when the body ends; a body error is yielded once as
/// [`SourceError::Transport`].
pub fn sse_stream<S, B, E>(body: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let state = (body, SseDecoder::new(), VecDeque::new());

    futures::stream::unfold(state, |(mut body, mut decoder, mut ready)| async move {
        loop {
            if let Some(item) = ready.pop_front() {
                return Some((Ok(item), (body, decoder, ready)));
            }
            match body.next().await {
                Some(Ok(chunk)) => {
                    ready.extend(
                        decoder
                            .feed(chunk.as_ref())
                            .into_iter()
                            .filter_map(frame_to_event),
                    );
                }
                Some(Err(e)) => {
                    let err = SourceError::Transport(e.to_string());
                    return Some((Err(err), (body, decoder, ready)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

fn frame_to_event(frame: SseFrame) -> Option<SourceEvent> {
    match frame {
        SseFrame::Comment(_) => Some(SourceEvent::Heartbeat),
        SseFrame::Event(event) => {
            if let Some(retry) = event.retry {
                tracing::debug!(
                    retry_ms = retry.as_millis() as u64,
                    "Server suggested a reconnection delay, keeping configured backoff",
                );
            }
            match event.event.as_deref() {
                None | Some(SSE_EVENT_MESSAGE) => Some(SourceEvent::Message(event.data)),
                Some(other) => {
                    tracing::debug!(event = other, data = %event.data, "Skipping named stream event");
                    None
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// WebSocket transport carrying one JSON notification per text frame.
pub struct WsSource {
    url: String,
}

impl WsSource {
    /// * `url` - WebSocket URL, e.g. `ws://host:8000/api/v1/ws/events`.
    pub fn new(url: String) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EventSource for WsSource {
    async fn connect(&self) -> Result<EventStream, SourceError> {
        let (ws_stream, _response) = connect_async(self.url.as_str()).await.map_err(|e| {
            SourceError::Connect(format!("Failed to connect to {}: {e}", self.url))
        })?;

        tracing::info!(url = %self.url, "WebSocket event stream opened");

        let stream = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => Some(Ok(SourceEvent::Message(text))),
                Ok(Message::Ping(_) | Message::Pong(_)) => Some(Ok(SourceEvent::Heartbeat)),
                Ok(Message::Close(frame)) => Some(Err(SourceError::Transport(format!(
                    "WebSocket closed by server: {frame:?}"
                )))),
                // Binary / Frame -- not part of the protocol.
                Ok(_) => None,
                Err(e) => Some(Err(SourceError::Transport(e.to_string()))),
            }
        });

        Ok(stream.boxed())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], String>> + Unpin {
        futures::stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn sse_stream_yields_messages_and_heartbeats() {
        let body = chunks(&[
            "event: connected\ndata: ok\n\n",
            ": heartbeat\n\n",
            "event: message\ndata: {\"table\":\"jobs\"",
            "}\n\ndata: second\n\n",
        ]);

        let items: Vec<_> = sse_stream(body).collect().await;
        let items: Vec<SourceEvent> = items.into_iter().map(Result::unwrap).collect();

        assert_eq!(
            items,
            vec![
                SourceEvent::Heartbeat,
                SourceEvent::Message(r#"{"table":"jobs"}"#.into()),
                SourceEvent::Message("second".into()),
            ]
        );
    }

    #[tokio::test]
    async fn sse_stream_surfaces_body_errors() {
        let body = futures::stream::iter(vec![
            Ok::<&'static [u8], String>(b"data: one\n\n"),
            Err("connection reset".to_string()),
        ]);

        let mut stream = sse_stream(body);
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            SourceEvent::Message("one".into())
        );
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, SourceError::Transport(ref msg) if msg.contains("reset")));
    }

    #[test]
    fn ticket_auth_debug_redacts_token() {
        let auth = TicketAuth {
            ticket_url: "http://host/api/v1/sse/ticket".into(),
            bearer_token: "secret".into(),
        };
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("ticket_url"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connect_error() {
        let source = SseSource::new("http://127.0.0.1:9/api/v1/sse/events".into());
        let err = source.connect().await.err().unwrap();
        assert!(matches!(err, SourceError::Connect(_)));
    }

    // -- local HTTP server ----------------------------------------------------

    /// Answer one connection per canned response; yields the request heads.
    async fn serve(responses: Vec<String>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let mut heads = Vec::new();
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                heads.push(String::from_utf8_lossy(&head).into_owned());
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            heads
        });

        (base, server)
    }

    fn event_stream_response(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n{body}"
        )
    }

    fn response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    const PAYLOAD: &str = r#"{"table":"jobs","operation":"UPDATE","id":"9","workflow_id":"5","new_status":"done"}"#;

    #[tokio::test]
    async fn sse_source_streams_messages_from_server() {
        let body = format!("event: connected\ndata: ok\n\n: ping\n\ndata: {PAYLOAD}\n\n");
        let (base, server) = serve(vec![event_stream_response(&body)]).await;

        let source = SseSource::with_client(local_client(), format!("{base}/api/v1/sse/events"));
        let stream = source.connect().await.unwrap();
        let items: Vec<SourceEvent> = stream.map(Result::unwrap).collect().await;

        assert_eq!(
            items,
            vec![SourceEvent::Heartbeat, SourceEvent::Message(PAYLOAD.into())]
        );

        let heads = server.await.unwrap();
        assert!(heads[0].starts_with("GET /api/v1/sse/events HTTP/1.1"), "{}", heads[0]);
        let head = heads[0].to_ascii_lowercase();
        assert!(head.contains("accept: text/event-stream"));
        assert!(head.contains("cache-control: no-cache"));
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let (base, _server) =
            serve(vec![response("401 Unauthorized", "text/plain", "unauthorized")]).await;

        let source = SseSource::with_client(local_client(), format!("{base}/api/v1/sse/events"));
        let err = source.connect().await.err().unwrap();

        assert_matches!(err, SourceError::Rejected { status: 401, ref body } if body == "unauthorized");
    }

    #[tokio::test]
    async fn ticket_is_exchanged_and_passed_as_token() {
        let (base, server) = serve(vec![
            response("200 OK", "application/json", r#"{"ticket":"t-123"}"#),
            event_stream_response(&format!("data: {PAYLOAD}\n\n")),
        ])
        .await;

        let source = SseSource::with_client(local_client(), format!("{base}/api/v1/sse/events"))
            .with_ticket_auth(TicketAuth {
                ticket_url: format!("{base}/api/v1/sse/ticket"),
                bearer_token: "secret".into(),
            });
        let stream = source.connect().await.unwrap();
        let items: Vec<SourceEvent> = stream.map(Result::unwrap).collect().await;
        assert_eq!(items, vec![SourceEvent::Message(PAYLOAD.into())]);

        let heads = server.await.unwrap();
        assert!(heads[0].starts_with("POST /api/v1/sse/ticket HTTP/1.1"), "{}", heads[0]);
        assert!(heads[0].to_ascii_lowercase().contains("authorization: bearer secret"));
        assert!(
            heads[1].starts_with("GET /api/v1/sse/events?token=t-123 HTTP/1.1"),
            "{}",
            heads[1]
        );
        assert!(!heads[1].to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn refused_ticket_is_an_auth_error() {
        let (base, _server) = serve(vec![response("403 Forbidden", "text/plain", "nope")]).await;

        let source = SseSource::with_client(local_client(), format!("{base}/api/v1/sse/events"))
            .with_ticket_auth(TicketAuth {
                ticket_url: format!("{base}/api/v1/sse/ticket"),
                bearer_token: "secret".into(),
            });
        let err = source.connect().await.err().unwrap();

        assert_matches!(err, SourceError::Auth(ref msg) if msg.contains("403"));
    }
}
