//! In-memory doubles for driving the engine without a network.
//!
//! [`ChannelSource`] is an [`EventSource`] whose connection attempts are
//! resolved by a [`SourceController`]: each call to
//! [`accept`](SourceController::accept) or
//! [`refuse`](SourceController::refuse) decides the outcome of the next
//! attempt, and the returned [`Session`] pushes messages, heartbeats and
//! errors into the open stream. [`RecordingCache`] records every
//! invalidation with the (possibly paused) tokio clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use flowsync_core::topics::Topic;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cache::CacheInterface;
use crate::source::{EventSource, EventStream, SourceError, SourceEvent};

type Outcome = Result<EventStream, SourceError>;

/// Scripted event source.
pub struct ChannelSource {
    outcomes: tokio::sync::Mutex<mpsc::UnboundedReceiver<Outcome>>,
    attempts: AtomicUsize,
}

impl ChannelSource {
    pub fn new() -> (Arc<Self>, SourceController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(Self {
            outcomes: tokio::sync::Mutex::new(rx),
            attempts: AtomicUsize::new(0),
        });
        (source, SourceController { outcomes: tx })
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn connect(&self) -> Result<EventStream, SourceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().await;
        match outcomes.recv().await {
            Some(outcome) => outcome,
            // Controller gone: the attempt never resolves.
            None => std::future::pending().await,
        }
    }

    fn describe(&self) -> String {
        "channel://test".to_string()
    }
}

/// Decides the outcome of pending and future connection attempts.
pub struct SourceController {
    outcomes: mpsc::UnboundedSender<Outcome>,
}

impl SourceController {
    /// Let the next connection attempt succeed.
    pub fn accept(&self) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream =
            futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
                .boxed();
        let _ = self.outcomes.send(Ok(stream));
        Session { tx }
    }

    /// Make the next connection attempt fail.
    pub fn refuse(&self, reason: &str) {
        let _ = self
            .outcomes
            .send(Err(SourceError::Connect(reason.to_string())));
    }
}

/// The server side of an accepted connection.
///
/// Dropping the session ends the stream, which the engine treats as the
/// server closing the connection.
pub struct Session {
    tx: mpsc::UnboundedSender<Result<SourceEvent, SourceError>>,
}

impl Session {
    /// Push a raw payload. Returns `false` once the engine closed the stream.
    pub fn send(&self, raw: impl Into<String>) -> bool {
        self.tx.send(Ok(SourceEvent::Message(raw.into()))).is_ok()
    }

    pub fn heartbeat(&self) -> bool {
        self.tx.send(Ok(SourceEvent::Heartbeat)).is_ok()
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, reason: &str) -> bool {
        self.tx
            .send(Err(SourceError::Transport(reason.to_string())))
            .is_ok()
    }

    /// Whether the engine has dropped (closed) this connection.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Cache double that records every invalidation.
#[derive(Default)]
pub struct RecordingCache {
    calls: Mutex<Vec<(Topic, Instant)>>,
}

impl RecordingCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<(Topic, Instant)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, topic: Topic) -> usize {
        self.calls().iter().filter(|(t, _)| *t == topic).count()
    }

    pub fn total(&self) -> usize {
        self.calls().len()
    }
}

impl CacheInterface for RecordingCache {
    fn invalidate(&self, topic: Topic) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic, Instant::now()));
    }
}
