//! Shared vocabulary for the flowsync workspace.
//!
//! Holds the identifier aliases, the wire-level table and operation
//! names emitted by the backend change triggers, and the cache
//! [`Topic`](topics::Topic)s that invalidations are grouped under.

pub mod topics;
pub mod types;
pub mod wire;
