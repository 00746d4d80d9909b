//! Realtime change feed published by the repositories after every committed write

use crate::config;
use crate::infrastructure::entities::{Conversation, Message};
use di::{inject, injectable};
use log::debug;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ChangeEvent {
    ConversationChanged(Conversation),
    MessageInserted(Message),
    MessageUpdated(Message),
}

/// Fan-out of store changes. Receivers that fall behind lose the oldest events
/// and are expected to re-read state.
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

#[injectable]
impl ChangeFeed {
    #[inject]
    pub fn create() -> ChangeFeed {
        ChangeFeed::with_capacity(config::change_feed_capacity())
    }
}

impl ChangeFeed {
    pub fn with_capacity(capacity: usize) -> ChangeFeed {
        let (sender, _) = broadcast::channel(capacity.max(1));
        ChangeFeed { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // no receivers is fine, nobody is watching yet
        if self.sender.send(event).is_err() {
            debug!("change feed has no receivers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}
