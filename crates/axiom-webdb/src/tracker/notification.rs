//! Host notifications
//!
//! Subscribers get an unbounded channel. The subscriber list sits behind its
//! own mutex, which may be taken with or without the tracker locks held.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::origin::SecurityOrigin;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerNotification {
    /// A committing transaction changed the database
    DatabaseChanged {
        origin: SecurityOrigin,
        name: String,
        usage: u64,
    },
    /// An origin asked for more space than its quota allows
    QuotaExceeded {
        origin: SecurityOrigin,
        name: String,
        current_usage: u64,
        requested_usage: u64,
        quota: u64,
    },
    DatabaseDeleted {
        origin: SecurityOrigin,
        name: String,
    },
}

impl TrackerNotification {
    pub fn origin(&self) -> &SecurityOrigin {
        match self {
            TrackerNotification::DatabaseChanged { origin, .. }
            | TrackerNotification::QuotaExceeded { origin, .. }
            | TrackerNotification::DatabaseDeleted { origin, .. } => origin,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TrackerNotification::DatabaseChanged { name, .. }
            | TrackerNotification::QuotaExceeded { name, .. }
            | TrackerNotification::DatabaseDeleted { name, .. } => name,
        }
    }
}

#[derive(Default)]
pub(crate) struct Notifier {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TrackerNotification>>>,
}

impl Notifier {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TrackerNotification> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Fan out to every live subscriber, forgetting the ones that hung up
    pub fn notify(&self, notification: TrackerNotification) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let notifier = Notifier::default();
        let mut kept = notifier.subscribe();
        let dropped = notifier.subscribe();
        drop(dropped);

        let origin = SecurityOrigin::new("https", "a.test", 443);
        notifier.notify(TrackerNotification::DatabaseDeleted {
            origin: origin.clone(),
            name: "db".into(),
        });

        assert_eq!(notifier.subscribers.lock().len(), 1);
        let received = kept.try_recv().unwrap();
        assert_eq!(received.origin(), &origin);
        assert_eq!(received.name(), "db");
    }
}
