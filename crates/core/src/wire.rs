//! Well-known names used in change notification payloads.
//!
//! These must match the values written by the `notify_table_changes`
//! trigger on the backend (`table` and `operation` JSON fields).

/// Table name carried by workflow change notifications.
pub const TABLE_WORKFLOWS: &str = "workflows";

/// Table name carried by job change notifications.
pub const TABLE_JOBS: &str = "jobs";

/// A row was inserted.
pub const OP_INSERT: &str = "INSERT";

/// A row was updated.
pub const OP_UPDATE: &str = "UPDATE";

/// A row was deleted.
pub const OP_DELETE: &str = "DELETE";

/// SSE event name used by the backend for change notifications.
///
/// Frames without an `event:` field are treated the same way.
pub const SSE_EVENT_MESSAGE: &str = "message";
