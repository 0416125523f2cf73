//! Real-time cache synchronization engine.
//!
//! Keeps a local read cache of workflow/job state fresh by listening to
//! the backend's push event stream instead of polling. Each change
//! notification is decoded, checked against the set of entities the
//! current view cares about, and turned into at most one debounced
//! invalidation of a cache [`Topic`](flowsync_core::topics::Topic).
//!
//! - [`SyncEngine`] / [`SyncHandle`]: the engine loop and its owner-facing handle.
//! - [`source::EventSource`]: injectable transport; see [`client`] for
//!   the SSE and WebSocket implementations.
//! - [`scheduler::InvalidationScheduler`]: per-topic debounce with a max-wait ceiling.
//! - [`cache::CacheInterface`]: the single call into the data-fetching layer.

pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod engine;
pub mod messages;
pub mod reconnect;
pub mod scheduler;
pub mod source;
pub mod sse;
pub mod subscription;
pub mod testing;

pub use cache::{CacheInterface, TaggedCache};
pub use config::SyncConfig;
pub use engine::{ConnectionState, ConnectionStatus, SyncEngine, SyncHandle};
pub use subscription::SubscriptionSet;
