//! Infrastructure traits, used for DI on higher levels

use crate::infrastructure::entities;
use crate::infrastructure::entities::{MessageStatus, Role};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Row filter for conversation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFilter {
    /// Conversations of one patient.
    Patient(Uuid),
    /// Conversations claimed by one attendant plus the unclaimed queue.
    AttendantQueue(Uuid),
    All,
}

impl ConversationFilter {
    pub fn admits(&self, conversation: &entities::Conversation) -> bool {
        match *self {
            ConversationFilter::Patient(patient_id) => conversation.patient_id == patient_id,
            ConversationFilter::AttendantQueue(attendant_id) => conversation
                .attendant_id
                .is_none_or(|assigned| assigned == attendant_id),
            ConversationFilter::All => true,
        }
    }
}

/// Result of trying to append a message to a conversation.
#[derive(Debug)]
pub enum AppendOutcome {
    Appended {
        message: entities::Message,
        conversation: entities::Conversation,
    },
    ConversationMissing,
    ConversationClosed,
}

#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn find_profile(&self, id: Uuid) -> Result<Option<entities::UserProfile>, StoreError>;

    /// Inserts the profile unless one already exists for the same id, and returns
    /// whichever profile is stored afterwards.
    async fn insert_profile_if_absent(
        &self,
        profile: entities::UserProfile,
    ) -> Result<entities::UserProfile, StoreError>;

    async fn list_profiles(&self) -> Result<Vec<entities::UserProfile>, StoreError>;

    async fn update_role(
        &self,
        id: Uuid,
        role: Role,
    ) -> Result<Option<entities::UserProfile>, StoreError>;

    async fn update_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<Option<entities::UserProfile>, StoreError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
    ) -> Result<Vec<entities::Conversation>, StoreError>;

    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    /// Stores the conversation and its opening messages in one transaction,
    /// numbered in the given order.
    async fn create_conversation(
        &self,
        conversation: entities::Conversation,
        messages: Vec<entities::NewMessage>,
    ) -> Result<(entities::Conversation, Vec<entities::Message>), StoreError>;

    /// Returns `None` if the conversation is missing or closed.
    async fn assign_conversation(
        &self,
        conversation_id: Uuid,
        attendant_id: Uuid,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    /// Returns `None` unless the conversation exists and is open.
    async fn mark_waiting(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<entities::Conversation>, StoreError>;

    /// Returns `None` if the conversation is missing or already closed.
    async fn close_conversation(
        &self,
        conversation_id: Uuid,
        closed_at: DateTime<Utc>,
        rating: Option<i64>,
        feedback: Option<String>,
    ) -> Result<Option<entities::Conversation>, StoreError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// All messages of a conversation, oldest first.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<entities::Message>, StoreError>;

    async fn find_message(&self, message_id: Uuid)
    -> Result<Option<entities::Message>, StoreError>;

    async fn append_message(
        &self,
        message: entities::NewMessage,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, StoreError>;

    /// Moves the message to `status` if its current status precedes it.
    /// Returns `None` when nothing changed.
    async fn advance_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<entities::Message>, StoreError>;
}
