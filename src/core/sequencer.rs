//! Serializes appends per conversation, so the order in which messages are
//! stored is also the order in which their notifications are published.

use di::{inject, injectable};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

const PRUNE_THRESHOLD: usize = 1024;

pub struct AppendSequencer {
    lanes: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

#[injectable]
impl AppendSequencer {
    #[inject]
    pub fn create() -> AppendSequencer {
        AppendSequencer::new()
    }
}

impl Default for AppendSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl AppendSequencer {
    pub fn new() -> AppendSequencer {
        AppendSequencer {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for exclusive access to the conversation's append lane.
    pub async fn enter(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            if lanes.len() >= PRUNE_THRESHOLD {
                // lanes nobody holds or waits on
                lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
            }
            lanes.entry(conversation_id).or_default().clone()
        };
        lane.lock_owned().await
    }

    pub fn lane_count(&self) -> usize {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
