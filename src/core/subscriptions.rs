//! Per-conversation realtime subscriptions.
//!
//! Listeners live in an arena of slots per conversation; a
//! [`SubscriptionHandle`] remembers its slot and frees it on release. The
//! registry is fed from the store's [`ChangeFeed`], which may repeat events, so
//! each conversation remembers the furthest delivery status it already
//! dispatched per message and drops anything that is not newer. When the relay
//! falls behind the feed, every listener is told to resync instead.

use crate::infrastructure::changes::{ChangeEvent, ChangeFeed};
use crate::infrastructure::entities::{Message, MessageStatus};
use di::{Ref, inject, injectable};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Number of message ids a topic remembers for dedupe. Redelivered events
/// arrive close to the original, so older ids can be forgotten.
const DEDUPE_WINDOW: usize = 512;

#[derive(Debug, Clone, Copy)]
pub enum SubscriptionEvent<'a> {
    /// A new or status-updated message of the subscribed conversation.
    Message(&'a Message),
    /// Notifications were lost; re-fetch the conversation.
    Resync,
}

/// Runs on the relay task, so it should hand the event off rather than block.
pub type Listener = Box<dyn Fn(SubscriptionEvent<'_>) + Send + Sync>;

struct Subscriber {
    active: AtomicBool,
    listener: Listener,
}

#[derive(Default)]
struct Topic {
    slots: Vec<Option<Arc<Subscriber>>>,
    free: Vec<usize>,
    live: usize,
    delivered: HashMap<Uuid, MessageStatus>,
    delivered_order: VecDeque<Uuid>,
}

impl Topic {
    fn insert(&mut self, subscriber: Arc<Subscriber>) -> usize {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(subscriber);
                slot
            }
            None => {
                self.slots.push(Some(subscriber));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, slot: usize, subscriber: &Arc<Subscriber>) {
        let occupied = matches!(
            self.slots.get(slot),
            Some(Some(current)) if Arc::ptr_eq(current, subscriber)
        );
        if occupied {
            self.slots[slot] = None;
            self.free.push(slot);
            self.live -= 1;
        }
    }

    /// Records the message and tells whether it is news for this topic.
    fn admit(&mut self, message: &Message) -> bool {
        match self.delivered.get_mut(&message.id) {
            Some(seen) if *seen >= message.status => false,
            Some(seen) => {
                *seen = message.status;
                true
            }
            None => {
                self.delivered.insert(message.id, message.status);
                self.delivered_order.push_back(message.id);
                if self.delivered_order.len() > DEDUPE_WINDOW {
                    if let Some(oldest) = self.delivered_order.pop_front() {
                        self.delivered.remove(&oldest);
                    }
                }
                true
            }
        }
    }

    fn subscribers(&self) -> Vec<Arc<Subscriber>> {
        self.slots.iter().flatten().cloned().collect()
    }
}

type Topics = Mutex<HashMap<Uuid, Topic>>;

fn lock(topics: &Topics) -> MutexGuard<'_, HashMap<Uuid, Topic>> {
    topics.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SubscriptionRegistry {
    topics: Arc<Topics>,
}

#[injectable]
impl SubscriptionRegistry {
    #[inject]
    pub fn create(changes: Ref<ChangeFeed>) -> SubscriptionRegistry {
        let registry = SubscriptionRegistry::new();
        registry.relay_from(changes.subscribe());
        registry
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    /// A registry that is not attached to any change feed.
    pub fn new() -> SubscriptionRegistry {
        SubscriptionRegistry {
            topics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawns the task forwarding message changes from `feed` to subscribers.
    /// The task ends when the feed closes or the registry is dropped.
    pub fn relay_from(&self, feed: broadcast::Receiver<ChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(relay(feed, Arc::downgrade(&self.topics)))
    }

    pub fn subscribe(&self, conversation_id: Uuid, listener: Listener) -> SubscriptionHandle {
        let subscriber = Arc::new(Subscriber {
            active: AtomicBool::new(true),
            listener,
        });

        let slot = lock(&self.topics)
            .entry(conversation_id)
            .or_default()
            .insert(subscriber.clone());

        debug!("subscribed to conversation {conversation_id} in slot {slot}");

        SubscriptionHandle {
            conversation_id,
            slot,
            subscriber,
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// Delivers `message` to the subscribers of its conversation and returns how
    /// many listeners were invoked.
    pub fn dispatch(&self, message: &Message) -> usize {
        dispatch_to(&self.topics, message)
    }

    pub fn subscriber_count(&self, conversation_id: Uuid) -> usize {
        lock(&self.topics)
            .get(&conversation_id)
            .map_or(0, |topic| topic.live)
    }
}

fn dispatch_to(topics: &Topics, message: &Message) -> usize {
    let subscribers: Vec<Arc<Subscriber>> = {
        let mut topics = lock(topics);
        let Some(topic) = topics.get_mut(&message.conversation_id) else {
            return 0;
        };
        if !topic.admit(message) {
            debug!("dropping repeated notification for message {}", message.id);
            return 0;
        }
        topic.subscribers()
    };

    notify(subscribers, SubscriptionEvent::Message(message))
}

/// Tells every live listener that it missed notifications.
fn resync_all(topics: &Topics) -> usize {
    let subscribers: Vec<Arc<Subscriber>> = lock(topics)
        .values()
        .flat_map(Topic::subscribers)
        .collect();

    notify(subscribers, SubscriptionEvent::Resync)
}

// listeners run outside the lock so they may release their own handle
fn notify(subscribers: Vec<Arc<Subscriber>>, event: SubscriptionEvent<'_>) -> usize {
    let mut invoked = 0;
    for subscriber in subscribers {
        if subscriber.active.load(Ordering::Acquire) {
            (subscriber.listener)(event);
            invoked += 1;
        }
    }
    invoked
}

async fn relay(mut feed: broadcast::Receiver<ChangeEvent>, topics: Weak<Topics>) {
    loop {
        let event = match feed.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                let Some(topics) = topics.upgrade() else {
                    return;
                };
                let notified = resync_all(&topics);
                warn!(
                    "realtime relay fell behind, {skipped} change events were skipped, {notified} listeners asked to resync"
                );
                continue;
            }
            Err(RecvError::Closed) => return,
        };

        let Some(topics) = topics.upgrade() else {
            return;
        };

        match event {
            ChangeEvent::MessageInserted(message) | ChangeEvent::MessageUpdated(message) => {
                dispatch_to(&topics, &message);
            }
            ChangeEvent::ConversationChanged(_) => {}
        }
    }
}

/// Keeps a listener registered. Released explicitly or on drop; releasing
/// twice is harmless.
pub struct SubscriptionHandle {
    conversation_id: Uuid,
    slot: usize,
    subscriber: Arc<Subscriber>,
    topics: Weak<Topics>,
}

impl SubscriptionHandle {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        if !self.subscriber.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let Some(topics) = self.topics.upgrade() else {
            return;
        };
        let mut topics = lock(&topics);
        if let Some(topic) = topics.get_mut(&self.conversation_id) {
            topic.remove(self.slot, &self.subscriber);
            if topic.live == 0 {
                topics.remove(&self.conversation_id);
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}
