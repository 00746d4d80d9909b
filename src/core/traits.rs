//! DI "Interfaces"

use crate::core::error::Result;
use crate::core::identity::Identity;
use crate::core::subscriptions::{Listener, SubscriptionHandle};
use crate::core::watch::ConversationWatch;
use crate::infrastructure::entities;
use crate::infrastructure::entities::{Channel, MessageType, Role};
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Returns the profile of the identity, creating a patient profile on first
    /// login.
    async fn load_or_create(&self, identity: &Identity) -> Result<entities::UserProfile>;

    async fn get_profile(&self, user_id: Uuid) -> Result<entities::UserProfile>;

    /// All profiles, newest first.
    async fn list_profiles(&self) -> Result<Vec<entities::UserProfile>>;

    async fn set_role(&self, user_id: Uuid, role: Role) -> Result<entities::UserProfile>;

    /// Profiles are never deleted, only deactivated.
    async fn set_active(&self, user_id: Uuid, is_active: bool) -> Result<entities::UserProfile>;
}

#[async_trait]
pub trait ConversationService: Send + Sync {
    /// Lists the conversations the caller may see, most recently active first.
    async fn list_conversations(
        &self,
        role: Role,
        user_id: Uuid,
    ) -> Result<Vec<entities::Conversation>>;

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<entities::Conversation>;

    /// Opens a new conversation for the patient and posts the welcome message.
    ///
    /// Returns `Validation` if the patient id is nil.
    async fn create_conversation(
        &self,
        patient_id: Uuid,
        channel: Channel,
        subject: Option<String>,
    ) -> Result<entities::Conversation>;

    /// Like `create_conversation`, with the caller's first message stored in the
    /// same transaction. Nothing is stored if the message is rejected.
    async fn create_conversation_with_message(
        &self,
        patient_id: Uuid,
        channel: Channel,
        subject: Option<String>,
        sender_id: Uuid,
        message: OutgoingMessage,
    ) -> Result<(entities::Conversation, entities::Message)>;

    /// Like `create_conversation`, with the channel given by name.
    async fn create_conversation_on(
        &self,
        patient_id: Uuid,
        channel: &str,
        subject: Option<String>,
    ) -> Result<entities::Conversation> {
        let channel: Channel = channel.parse()?;
        self.create_conversation(patient_id, channel, subject).await
    }

    /// Claims the conversation for the attendant.
    ///
    /// Returns `NotFound` if the conversation does not exist and `InvalidState`
    /// if it is closed.
    async fn assign_conversation(
        &self,
        conversation_id: Uuid,
        attendant_id: Uuid,
    ) -> Result<entities::Conversation>;

    /// Moves an open conversation to waiting.
    async fn mark_waiting(&self, conversation_id: Uuid) -> Result<entities::Conversation>;

    /// Closes the conversation with an optional 1-5 rating and feedback text.
    ///
    /// Returns `InvalidState` if it is already closed.
    async fn close_conversation(
        &self,
        conversation_id: Uuid,
        rating: Option<i64>,
        feedback: Option<String>,
    ) -> Result<entities::Conversation>;

    /// Live conversation changes, filtered like `list_conversations`.
    fn watch_conversations(&self, role: Role, user_id: Uuid) -> ConversationWatch;
}

/// Content of a message about to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Text,
            file_url: None,
        }
    }

    pub fn file(file_url: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            content: caption.into(),
            message_type: MessageType::File,
            file_url: Some(file_url.into()),
        }
    }
}

#[async_trait]
pub trait MessageService: Send + Sync {
    /// All messages of the conversation, oldest first.
    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<entities::Message>>;

    async fn get_message(&self, message_id: Uuid) -> Result<entities::Message>;

    /// Appends a message and notifies the conversation's subscribers.
    ///
    /// Returns `NotFound` for an unknown conversation, `InvalidState` if it is
    /// closed and `Validation` if there is nothing to send.
    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        message: OutgoingMessage,
    ) -> Result<entities::Message>;

    async fn send_text(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
    ) -> Result<entities::Message> {
        self.send_message(conversation_id, sender_id, OutgoingMessage::text(content))
            .await
    }

    /// Advances the message to read. Already read messages are returned as-is.
    async fn mark_read(&self, message_id: Uuid) -> Result<entities::Message>;

    /// Advances a sent message to delivered. Later statuses are left alone.
    async fn mark_delivered(&self, message_id: Uuid) -> Result<entities::Message>;

    fn subscribe(&self, conversation_id: Uuid, listener: Listener) -> SubscriptionHandle;
}
