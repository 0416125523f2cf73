/// Workflow and job identifiers are opaque strings (UUIDs on the backend).
pub type EntityId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
