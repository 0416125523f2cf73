//! The synchronization engine loop and its owner-facing handle.
//!
//! [`SyncEngine::start`] spawns one task that owns the connection, the
//! invalidation scheduler and the backoff state. Everything runs on that
//! task's `tokio::select!` loop, so none of it needs locking. The owning
//! scope talks to the loop through a [`SyncHandle`]:
//!
//! - the interest set travels over a `watch` channel and is read as an
//!   immutable snapshot per notification;
//! - connection status comes back over another `watch` channel;
//! - reconnect / pause / resume are commands on an unbounded `mpsc`;
//! - teardown cancels a [`CancellationToken`], which the loop checks
//!   before anything else.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flowsync_core::topics::Topic;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheInterface;
use crate::classify::{classify, ClassifyPolicy};
use crate::config::SyncConfig;
use crate::messages::decode;
use crate::reconnect::Backoff;
use crate::scheduler::InvalidationScheduler;
use crate::source::{EventSource, EventStream, SourceError, SourceEvent};
use crate::subscription::SubscriptionSet;

/// How long [`SyncHandle::shutdown`] waits for the loop to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic refreshed unconditionally after every successful open.
const PRIMARY_TOPIC: Topic = Topic::WORKFLOWS;

type ConnectFuture = BoxFuture<'static, Result<EventStream, SourceError>>;

/// Connectivity of the event stream as seen by the owning scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not started, paused, or torn down.
    #[default]
    Off,
    /// Waiting for the first open, or reconnecting after an error.
    Connecting,
    /// The stream is open and delivering notifications.
    Online,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Connecting => "connecting",
            Self::Online => "online",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state plus the number of consecutive failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Failed connection attempts since the last successful open.
    pub retries: u32,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Reconnect,
    Pause,
    Resume,
}

/// Entry point of the engine.
pub struct SyncEngine;

impl SyncEngine {
    /// Spawn the engine loop and start connecting immediately.
    ///
    /// Must be called from within a tokio runtime. The engine runs until
    /// the returned handle is shut down or dropped.
    pub fn start(
        config: SyncConfig,
        source: Arc<dyn EventSource>,
        cache: Arc<dyn CacheInterface>,
    ) -> SyncHandle {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (interest_tx, interest_rx) = watch::channel(SubscriptionSet::default());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let engine_loop = EngineLoop {
            scheduler: config.scheduler(),
            policy: config.classify,
            idle_timeout: config.idle_timeout,
            connect_timeout: config.connect_timeout,
            backoff: Backoff::new(config.reconnect),
            source,
            cache,
            status_tx,
            interest_rx,
            control_rx,
            cancel: cancel.clone(),
            stream: None,
            connecting: None,
            retry_at: None,
            last_activity: Instant::now(),
            retries: 0,
            paused: config.start_paused,
        };

        let task = tokio::spawn(engine_loop.run());

        SyncHandle {
            status_rx,
            interest_tx,
            control_tx,
            cancel,
            task: Some(task),
        }
    }
}

/// Owner-side handle to a running engine.
///
/// Dropping the handle requests teardown: the loop observes the
/// cancellation before any other event, so nothing fires afterwards,
/// but the transport is released when the task next runs. Use
/// [`shutdown`](Self::shutdown) to wait until it is closed.
pub struct SyncHandle {
    status_rx: watch::Receiver<ConnectionStatus>,
    interest_tx: watch::Sender<SubscriptionSet>,
    control_tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Replace the interest set and return the current connection state.
    ///
    /// Takes effect from the next notification on; the connection is
    /// left alone.
    pub fn track<I, S>(&self, ids: I) -> ConnectionState
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_interest(SubscriptionSet::new(ids));
        self.state()
    }

    pub fn set_interest(&self, interest: SubscriptionSet) {
        self.interest_tx.send_replace(interest);
    }

    /// The interest snapshot the engine currently evaluates against.
    pub fn interest(&self) -> SubscriptionSet {
        self.interest_tx.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Drop the current session and reconnect now, resetting backoff.
    pub fn reconnect(&self) {
        self.send(Control::Reconnect);
    }

    /// Close the connection and go `Off` without tearing down.
    pub fn pause(&self) {
        self.send(Control::Pause);
    }

    pub fn resume(&self) {
        self.send(Control::Resume);
    }

    /// Whether the engine loop is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Tear the engine down and wait for its loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Sync engine task failed"),
                Err(_) => tracing::warn!(
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Sync engine did not stop in time",
                ),
            }
        }
    }

    fn send(&self, control: Control) {
        if self.control_tx.send(control).is_err() {
            tracing::debug!(?control, "Sync engine already stopped, ignoring command");
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// State owned by the engine task.
struct EngineLoop {
    source: Arc<dyn EventSource>,
    cache: Arc<dyn CacheInterface>,
    scheduler: InvalidationScheduler,
    policy: ClassifyPolicy,
    idle_timeout: Option<Duration>,
    connect_timeout: Duration,
    backoff: Backoff,

    status_tx: watch::Sender<ConnectionStatus>,
    interest_rx: watch::Receiver<SubscriptionSet>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,

    /// Open session, if any.
    stream: Option<EventStream>,
    /// In-flight connection attempt, if any.
    connecting: Option<ConnectFuture>,
    /// When to start the next attempt after a failure.
    retry_at: Option<Instant>,
    /// Last message or heartbeat on the open session.
    last_activity: Instant,
    retries: u32,
    paused: bool,
}

impl EngineLoop {
    async fn run(mut self) {
        tracing::info!(
            endpoint = %self.source.describe(),
            paused = self.paused,
            "Sync engine started",
        );
        if self.paused {
            self.set_state(ConnectionState::Off);
        } else {
            self.begin_connect();
        }

        loop {
            let fire_at = self.scheduler.next_deadline();
            let retry_at = self.retry_at;
            let idle_at = self.idle_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(control) = self.control_rx.recv() => self.handle_control(control),

                _ = sleep_until_opt(fire_at) => self.fire_due(),

                result = await_connect(&mut self.connecting) => self.on_connect_result(result),

                _ = sleep_until_opt(retry_at) => self.begin_connect(),

                item = next_item(&mut self.stream) => self.on_stream_item(item),

                _ = sleep_until_opt(idle_at) => {
                    self.on_transport_lost("no traffic within idle timeout");
                }
            }
        }

        self.teardown();
    }

    fn idle_deadline(&self) -> Option<Instant> {
        match (&self.stream, self.idle_timeout) {
            (Some(_), Some(timeout)) => self.last_activity.checked_add(timeout),
            _ => None,
        }
    }

    // -- connection ---------------------------------------------------------

    fn begin_connect(&mut self) {
        self.retry_at = None;
        self.stream = None;

        let source = Arc::clone(&self.source);
        let timeout = self.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, source.connect()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Connect(format!(
                    "no response within {}s",
                    timeout.as_secs()
                ))),
            }
        }));
        self.set_state(ConnectionState::Connecting);

        tracing::debug!(
            attempt = self.retries + 1,
            endpoint = %self.source.describe(),
            "Connecting to event stream",
        );
    }

    fn on_connect_result(&mut self, result: Result<EventStream, SourceError>) {
        self.connecting = None;

        match result {
            Ok(stream) => {
                let now = Instant::now();
                self.stream = Some(stream);
                self.last_activity = now;
                self.backoff.reset();
                self.retries = 0;
                self.set_state(ConnectionState::Online);

                // Notifications may have been missed while disconnected.
                self.scheduler.schedule(PRIMARY_TOPIC, now);
            }
            Err(e) => {
                self.retries += 1;
                let delay = self.backoff.next_delay();
                self.retry_at = Instant::now().checked_add(delay);
                self.publish_status();

                tracing::warn!(
                    error = %e,
                    attempt = self.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Event stream connection failed, retrying",
                );
            }
        }
    }

    /// Drop the session and schedule a reconnect with backoff.
    fn on_transport_lost(&mut self, reason: &str) {
        self.stream = None;
        let delay = self.backoff.next_delay();
        self.retry_at = Instant::now().checked_add(delay);
        self.set_state(ConnectionState::Connecting);

        tracing::warn!(
            reason,
            delay_ms = delay.as_millis() as u64,
            "Event stream lost, reconnecting",
        );
    }

    fn on_stream_item(&mut self, item: Option<Result<SourceEvent, SourceError>>) {
        match item {
            Some(Ok(SourceEvent::Message(raw))) => {
                self.last_activity = Instant::now();
                self.handle_message(&raw);
            }
            Some(Ok(SourceEvent::Heartbeat)) => {
                self.last_activity = Instant::now();
                tracing::trace!("Event stream heartbeat");
            }
            Some(Err(e)) => self.on_transport_lost(&e.to_string()),
            None => self.on_transport_lost("stream closed by server"),
        }
    }

    // -- notifications ------------------------------------------------------

    fn handle_message(&mut self, raw: &str) {
        let notification = match decode(raw) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, raw_message = %raw, "Dropping malformed change notification");
                return;
            }
        };

        let interest = self.interest_rx.borrow().clone();
        let lag_ms = notification
            .emitted_at
            .map(|at| (chrono::Utc::now() - at).num_milliseconds());

        match classify(&notification, &interest, &self.policy) {
            Some(topic) => {
                tracing::debug!(
                    table = notification.entity_kind.as_str(),
                    operation = notification.operation.as_str(),
                    id = %notification.entity_id,
                    topic = %topic,
                    lag_ms = ?lag_ms,
                    "Scheduling invalidation",
                );
                self.scheduler.schedule(topic, Instant::now());
            }
            None => {
                tracing::trace!(
                    table = notification.entity_kind.as_str(),
                    operation = notification.operation.as_str(),
                    id = %notification.entity_id,
                    "Notification not relevant",
                );
            }
        }
    }

    fn fire_due(&mut self) {
        for topic in self.scheduler.take_due(Instant::now()) {
            tracing::debug!(topic = %topic, "Invalidating cache topic");
            self.cache.invalidate(topic);
        }
    }

    // -- control ------------------------------------------------------------

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Reconnect => {
                if self.paused {
                    tracing::debug!("Reconnect requested while paused, ignoring");
                    return;
                }
                tracing::info!("Manual reconnect requested");
                self.connecting = None;
                self.backoff.reset();
                self.retries = 0;
                self.begin_connect();
            }
            Control::Pause => {
                if self.paused {
                    return;
                }
                self.paused = true;
                self.stream = None;
                self.connecting = None;
                self.retry_at = None;
                self.set_state(ConnectionState::Off);
                tracing::info!("Sync engine paused");
            }
            Control::Resume => {
                if !self.paused {
                    return;
                }
                self.paused = false;
                self.backoff.reset();
                self.retries = 0;
                tracing::info!("Sync engine resumed");
                self.begin_connect();
            }
        }
    }

    fn teardown(mut self) {
        self.stream = None;
        self.connecting = None;
        self.retry_at = None;
        let dropped = self.scheduler.cancel_all();
        self.set_state(ConnectionState::Off);

        tracing::info!(dropped_invalidations = dropped, "Sync engine stopped");
    }

    // -- status -------------------------------------------------------------

    fn set_state(&self, state: ConnectionState) {
        let previous = self.status_tx.borrow().state;
        self.publish(ConnectionStatus {
            state,
            retries: self.retries,
        });
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Connection state changed");
        }
    }

    fn publish_status(&self) {
        let state = self.status_tx.borrow().state;
        self.publish(ConnectionStatus {
            state,
            retries: self.retries,
        });
    }

    fn publish(&self, next: ConnectionStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Sleep until `deadline`, or forever when there is none.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn await_connect(connecting: &mut Option<ConnectFuture>) -> Result<EventStream, SourceError> {
    match connecting {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn next_item(stream: &mut Option<EventStream>) -> Option<Result<SourceEvent, SourceError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
