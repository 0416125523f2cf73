//! Cache invalidation topics.
//!
//! A topic names a group of cached queries that are refreshed together.
//! Listing queries tag themselves with the collection they display; a
//! query may carry several topics (a workflow progress view, for example,
//! depends on both collections).

use std::fmt;

use serde::Serialize;

/// A named invalidation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Topic(&'static str);

impl Topic {
    /// Workflow listings and details. Refreshed unconditionally after
    /// every successful (re)connection.
    pub const WORKFLOWS: Topic = Topic("workflow-collection");

    /// Job listings and anything derived from job state.
    pub const JOBS: Topic = Topic("job-collection");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
