//! Interest tracking for the active view.
//!
//! The embedding scope owns the set of entity ids it currently displays
//! and replaces it wholesale whenever its inputs change. The engine only
//! ever reads an immutable snapshot, so every notification is evaluated
//! against exactly one well-defined set.

use std::collections::HashSet;
use std::sync::Arc;

use flowsync_core::types::EntityId;

use crate::messages::{ChangeNotification, EntityKind};

/// Immutable snapshot of the ids the current view cares about.
///
/// Cloning is cheap (shared `Arc`), which lets the engine take a fresh
/// snapshot for each notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    ids: Arc<HashSet<EntityId>>,
}

impl SubscriptionSet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        Self {
            ids: Arc::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether `notification` concerns an entity in this snapshot.
    ///
    /// Job notifications are matched on their owning workflow, workflow
    /// notifications on their own id. A job notification without an
    /// owning workflow cannot be matched and is reported as not relevant.
    pub fn is_relevant(&self, notification: &ChangeNotification) -> bool {
        match notification.entity_kind {
            EntityKind::Workflow => self.contains(&notification.entity_id),
            EntityKind::Job => match notification.parent_id.as_deref() {
                Some(workflow_id) => self.contains(workflow_id),
                None => {
                    tracing::warn!(
                        job_id = %notification.entity_id,
                        operation = notification.operation.as_str(),
                        "Job notification without workflow_id, treating as not relevant",
                    );
                    false
                }
            },
        }
    }
}

impl<S: Into<EntityId>> FromIterator<S> for SubscriptionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Operation;

    fn job(parent: Option<&str>) -> ChangeNotification {
        ChangeNotification {
            entity_kind: EntityKind::Job,
            operation: Operation::Update,
            entity_id: "9".into(),
            parent_id: parent.map(String::from),
            new_status: Some("RUNNING".into()),
            emitted_at: None,
        }
    }

    fn workflow(id: &str) -> ChangeNotification {
        ChangeNotification {
            entity_kind: EntityKind::Workflow,
            operation: Operation::Update,
            entity_id: id.into(),
            parent_id: Some(id.into()),
            new_status: Some("RUNNING".into()),
            emitted_at: None,
        }
    }

    #[test]
    fn job_relevance_uses_parent_workflow() {
        let set = SubscriptionSet::new(["5"]);
        assert!(set.is_relevant(&job(Some("5"))));
        assert!(!set.is_relevant(&job(Some("6"))));
    }

    #[test]
    fn job_without_parent_is_not_relevant() {
        let set = SubscriptionSet::new(["5", "9"]);
        assert!(!set.is_relevant(&job(None)));
    }

    #[test]
    fn workflow_relevance_uses_own_id() {
        let set: SubscriptionSet = ["a", "b"].into_iter().collect();
        assert!(set.is_relevant(&workflow("a")));
        assert!(!set.is_relevant(&workflow("c")));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let set = SubscriptionSet::default();
        assert!(set.is_empty());
        assert!(!set.is_relevant(&workflow("a")));
        assert!(!set.is_relevant(&job(Some("a"))));
    }

    #[test]
    fn duplicates_collapse() {
        let set = SubscriptionSet::new(vec!["1".to_string(), "1".to_string(), "2".to_string()]);
        assert_eq!(set.len(), 2);
    }
}
