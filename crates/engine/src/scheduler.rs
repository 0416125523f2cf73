//! Per-topic debounced invalidation scheduling.
//!
//! [`InvalidationScheduler`] coalesces bursts of `schedule` calls into at
//! most one invalidation per topic per window. It is a plain data
//! structure driven by the engine loop: the loop sleeps until
//! [`next_deadline`](InvalidationScheduler::next_deadline) and then drains
//! [`take_due`](InvalidationScheduler::take_due). Owning no timers of its
//! own, it cannot fire after the loop has stopped.

use std::collections::HashMap;
use std::time::Duration;

use flowsync_core::topics::Topic;
use tokio::time::Instant;

/// Debounce window for one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    /// Quiet period after the last `schedule` call before firing.
    pub wait: Duration,
    /// Upper bound between the first `schedule` call of a window and
    /// firing, however often the window is re-triggered.
    pub max_wait: Duration,
}

impl DebounceConfig {
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self {
            wait,
            max_wait: max_wait.max(wait),
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(2000))
    }
}

/// Stand-in deadline for windows too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A scheduled but not yet executed invalidation.
#[derive(Debug, Clone, Copy)]
struct PendingInvalidation {
    /// When the current window opened.
    first_scheduled: Instant,
    deadline: Instant,
}

/// Trailing-edge debouncer with a max-wait ceiling, keyed by topic.
#[derive(Debug, Default)]
pub struct InvalidationScheduler {
    windows: HashMap<Topic, DebounceConfig>,
    fallback: DebounceConfig,
    pending: HashMap<Topic, PendingInvalidation>,
}

impl InvalidationScheduler {
    /// Create a scheduler using `fallback` for topics without their own window.
    pub fn new(fallback: DebounceConfig) -> Self {
        Self {
            windows: HashMap::new(),
            fallback,
            pending: HashMap::new(),
        }
    }

    /// Override the debounce window of a single topic.
    pub fn with_window(mut self, topic: Topic, window: DebounceConfig) -> Self {
        self.windows.insert(topic, window);
        self
    }

    pub fn window(&self, topic: Topic) -> DebounceConfig {
        self.windows.get(&topic).copied().unwrap_or(self.fallback)
    }

    /// Request an invalidation of `topic`.
    ///
    /// Opens a new window if none is pending; otherwise pushes the
    /// existing deadline out to `now + wait`, never past
    /// `first_scheduled + max_wait`.
    pub fn schedule(&mut self, topic: Topic, now: Instant) {
        let window = self.window(topic);

        match self.pending.get_mut(&topic) {
            Some(pending) => {
                let ceiling = after(pending.first_scheduled, window.max_wait);
                pending.deadline = after(now, window.wait).min(ceiling);
                tracing::trace!(topic = %topic, "Invalidation window extended");
            }
            None => {
                self.pending.insert(
                    topic,
                    PendingInvalidation {
                        first_scheduled: now,
                        deadline: after(now, window.wait),
                    },
                );
                tracing::trace!(topic = %topic, wait_ms = window.wait.as_millis() as u64, "Invalidation scheduled");
            }
        }
    }

    /// Earliest pending deadline, if anything is pending.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every topic whose deadline is at or before `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<Topic> {
        let mut due: Vec<Topic> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(topic, _)| *topic)
            .collect();
        due.sort();

        for topic in &due {
            self.pending.remove(topic);
        }
        due
    }

    pub fn is_pending(&self, topic: Topic) -> bool {
        self.pending.contains_key(&topic)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Discard every pending invalidation without firing. Returns how many
    /// were dropped.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}
