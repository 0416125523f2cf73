//! Maps a change notification to the cache topic it invalidates.

use flowsync_core::topics::Topic;

use crate::messages::{ChangeNotification, EntityKind};
use crate::subscription::SubscriptionSet;

/// Knobs for [`classify`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyPolicy {
    /// Also refresh on relevant updates that carry no status change
    /// (renames, tag edits). Off by default: the backend emits an update
    /// for every column write and most of them do not alter what a
    /// listing shows.
    pub refresh_on_field_updates: bool,
}

/// The collection topic an entity kind belongs to.
pub fn topic_for(kind: EntityKind) -> Topic {
    match kind {
        EntityKind::Workflow => Topic::WORKFLOWS,
        EntityKind::Job => Topic::JOBS,
    }
}

/// Decide which topic, if any, `notification` should invalidate.
///
/// - inserts and deletes always invalidate their collection;
/// - updates without a status change are dropped (see
///   [`ClassifyPolicy::refresh_on_field_updates`]);
/// - remaining updates invalidate their collection only when the view
///   is subscribed to the entity.
pub fn classify(
    notification: &ChangeNotification,
    interest: &SubscriptionSet,
    policy: &ClassifyPolicy,
) -> Option<Topic> {
    let topic = topic_for(notification.entity_kind);

    if notification.operation.changes_cardinality() {
        return Some(topic);
    }
    if !notification.has_status_change() && !policy.refresh_on_field_updates {
        return None;
    }
    interest.is_relevant(notification).then_some(topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Operation;

    fn notification(
        kind: EntityKind,
        operation: Operation,
        id: &str,
        parent: Option<&str>,
        status: Option<&str>,
    ) -> ChangeNotification {
        ChangeNotification {
            entity_kind: kind,
            operation,
            entity_id: id.into(),
            parent_id: parent.map(String::from),
            new_status: status.map(String::from),
            emitted_at: None,
        }
    }

    #[test]
    fn inserts_and_deletes_ignore_subscription() {
        let none = SubscriptionSet::default();
        let policy = ClassifyPolicy::default();

        for op in [Operation::Insert, Operation::Delete] {
            let wf = notification(EntityKind::Workflow, op, "5", None, None);
            let job = notification(EntityKind::Job, op, "9", Some("7"), None);
            assert_eq!(classify(&wf, &none, &policy), Some(Topic::WORKFLOWS));
            assert_eq!(classify(&job, &none, &policy), Some(Topic::JOBS));
        }
    }

    #[test]
    fn update_without_status_is_dropped() {
        let set = SubscriptionSet::new(["5"]);
        let policy = ClassifyPolicy::default();
        let wf = notification(EntityKind::Workflow, Operation::Update, "5", None, None);
        let job = notification(EntityKind::Job, Operation::Update, "9", Some("5"), None);
        assert_eq!(classify(&wf, &set, &policy), None);
        assert_eq!(classify(&job, &set, &policy), None);
    }

    #[test]
    fn field_updates_refresh_when_enabled() {
        let set = SubscriptionSet::new(["5"]);
        let policy = ClassifyPolicy {
            refresh_on_field_updates: true,
        };
        let subscribed = notification(EntityKind::Workflow, Operation::Update, "5", None, None);
        let other = notification(EntityKind::Workflow, Operation::Update, "6", None, None);
        assert_eq!(classify(&subscribed, &set, &policy), Some(Topic::WORKFLOWS));
        assert_eq!(classify(&other, &set, &policy), None);
    }

    #[test]
    fn status_update_follows_subscription() {
        let set = SubscriptionSet::new(["5"]);
        let policy = ClassifyPolicy::default();

        let inside = notification(EntityKind::Job, Operation::Update, "9", Some("5"), Some("done"));
        let outside = notification(EntityKind::Job, Operation::Update, "9", Some("6"), Some("done"));
        assert_eq!(classify(&inside, &set, &policy), Some(Topic::JOBS));
        assert_eq!(classify(&outside, &set, &policy), None);

        let wf = notification(EntityKind::Workflow, Operation::Update, "5", Some("5"), Some("done"));
        assert_eq!(classify(&wf, &set, &policy), Some(Topic::WORKFLOWS));
    }
}
