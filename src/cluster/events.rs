//! Cluster membership events.

/// A change to the member list that has been applied locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A member was appended to the list.
    Added {
        member: String,
    },

    /// A member was removed from the list.
    Removed {
        member: String,
    },
}

impl MemberEvent {
    /// Get the endpoint the event is about.
    pub fn member(&self) -> &str {
        match self {
            MemberEvent::Added { member } | MemberEvent::Removed { member } => member,
        }
    }
}

/// Listener for membership events.
pub trait MemberEventListener: Send + Sync + 'static {
    /// Called when a membership event occurs.
    fn on_event(&self, event: MemberEvent);
}

/// Event listener that logs events.
pub struct LoggingEventListener;

impl MemberEventListener for LoggingEventListener {
    fn on_event(&self, event: MemberEvent) {
        match &event {
            MemberEvent::Added { member } => {
                tracing::info!(%member, "Member added to cluster");
            }
            MemberEvent::Removed { member } => {
                tracing::info!(%member, "Member removed from cluster");
            }
        }
    }
}
