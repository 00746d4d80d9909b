//! Conversation change stream scoped to what a caller may see.

use crate::core::visibility::scope_for;
use crate::infrastructure::changes::ChangeEvent;
use crate::infrastructure::entities::{Conversation, Role};
use crate::infrastructure::traits::ConversationFilter;
use log::warn;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum ConversationUpdate {
    Changed(Conversation),
    /// Updates were dropped; the watcher should re-list.
    Resync,
}

pub struct ConversationWatch {
    filter: ConversationFilter,
    events: broadcast::Receiver<ChangeEvent>,
}

impl ConversationWatch {
    pub fn new(role: Role, user_id: Uuid, events: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            filter: scope_for(role, user_id),
            events,
        }
    }

    /// Waits for the next visible update. `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<ConversationUpdate> {
        loop {
            match self.events.recv().await {
                Ok(ChangeEvent::ConversationChanged(conversation))
                    if self.filter.admits(&conversation) =>
                {
                    return Some(ConversationUpdate::Changed(conversation));
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("conversation watch lagged, {skipped} updates dropped");
                    return Some(ConversationUpdate::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::changes::ChangeFeed;
    use crate::infrastructure::entities::{Channel, ConversationStatus};
    use chrono::Utc;

    fn conversation(patient_id: Uuid) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            patient_id,
            attendant_id: None,
            channel: Channel::Whatsapp,
            status: ConversationStatus::Open,
            subject: None,
            priority: 1,
            started_at: now,
            last_message_at: now,
            closed_at: None,
            rating: None,
            feedback: None,
        }
    }

    #[tokio::test]
    async fn patient_only_sees_own_conversations() {
        let feed = ChangeFeed::with_capacity(8);
        let patient = Uuid::new_v4();
        let mut watch = ConversationWatch::new(Role::Patient, patient, feed.subscribe());

        feed.publish(ChangeEvent::ConversationChanged(conversation(Uuid::new_v4())));
        let own = conversation(patient);
        feed.publish(ChangeEvent::ConversationChanged(own.clone()));

        match watch.next().await {
            Some(ConversationUpdate::Changed(seen)) => assert_eq!(seen.id, own.id),
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_watch_asks_for_resync() {
        let feed = ChangeFeed::with_capacity(1);
        let mut watch = ConversationWatch::new(Role::Manager, Uuid::new_v4(), feed.subscribe());

        feed.publish(ChangeEvent::ConversationChanged(conversation(Uuid::new_v4())));
        feed.publish(ChangeEvent::ConversationChanged(conversation(Uuid::new_v4())));

        assert!(matches!(watch.next().await, Some(ConversationUpdate::Resync)));
        assert!(matches!(watch.next().await, Some(ConversationUpdate::Changed(_))));
    }

    #[tokio::test]
    async fn ends_when_feed_is_dropped() {
        let feed = ChangeFeed::with_capacity(4);
        let mut watch = ConversationWatch::new(Role::Manager, Uuid::new_v4(), feed.subscribe());
        drop(feed);

        assert!(watch.next().await.is_none());
    }
}
