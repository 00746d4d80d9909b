//! Implementations for the service the app needs.
//!

use crate::core::error::{Error, Result};
use crate::core::identity::Identity;
use crate::core::retry::retry_read;
use crate::core::sequencer::AppendSequencer;
use crate::core::subscriptions::{Listener, SubscriptionHandle, SubscriptionRegistry};
use crate::core::traits::{ConversationService, MessageService, OutgoingMessage, ProfileService};
use crate::core::visibility::scope_for;
use crate::core::watch::ConversationWatch;
use crate::infrastructure::changes::ChangeFeed;
use crate::infrastructure::entities::{
    Channel, Conversation, ConversationStatus, Message, MessageStatus, MessageType, NewMessage,
    Role, SenderKind, UserProfile,
};
use crate::infrastructure::traits::{
    AppendOutcome, ConversationRepository, MessageRepository, ProfileRepository,
};
use async_trait::async_trait;
use chrono::Utc;
use di::{Ref, injectable};
use log::{debug, info};
use std::ops::RangeInclusive;
use uuid::Uuid;

/// Sender of automated messages.
pub const SYSTEM_SENDER_ID: Uuid = Uuid::nil();

pub const DEFAULT_PRIORITY: i64 = 1;

pub const RATING_RANGE: RangeInclusive<i64> = 1..=5;

pub const WELCOME_MESSAGE: &str = "Hello! 👋 Welcome to our support service.

I'm a virtual assistant and I've already registered your request. One of our attendants will reply shortly.

While you wait, feel free to describe what you need in more detail.";

#[injectable(ProfileService)]
pub struct MyProfileService {
    repo: Ref<dyn ProfileRepository>,
}

impl MyProfileService {
    pub fn new(repo: Ref<dyn ProfileRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ProfileService for MyProfileService {
    async fn load_or_create(&self, identity: &Identity) -> Result<UserProfile> {
        if identity.id.is_nil() {
            return Err(Error::validation("identity id is required"));
        }

        let repo = &self.repo;
        let id = identity.id;
        let existing = retry_read("load profile", move || async move {
            Ok::<_, Error>(repo.find_profile(id).await?)
        })
        .await?;

        if let Some(profile) = existing {
            return Ok(profile);
        }

        let now = Utc::now();
        let profile = self
            .repo
            .insert_profile_if_absent(UserProfile {
                id: identity.id,
                role: Role::Patient,
                full_name: identity.handle.clone(),
                is_active: true,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!("created {} profile for {}", profile.role, profile.id);
        Ok(profile)
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<UserProfile> {
        let repo = &self.repo;
        retry_read("get profile", move || async move {
            Ok::<_, Error>(repo.find_profile(user_id).await?)
        })
        .await?
        .ok_or(Error::profile_not_found(user_id))
    }

    async fn list_profiles(&self) -> Result<Vec<UserProfile>> {
        let repo = &self.repo;
        retry_read("list profiles", move || async move {
            Ok::<_, Error>(repo.list_profiles().await?)
        })
        .await
    }

    async fn set_role(&self, user_id: Uuid, role: Role) -> Result<UserProfile> {
        let profile = self
            .repo
            .update_role(user_id, role)
            .await?
            .ok_or(Error::profile_not_found(user_id))?;

        info!("profile {user_id} now has role {role}");
        Ok(profile)
    }

    async fn set_active(&self, user_id: Uuid, is_active: bool) -> Result<UserProfile> {
        let profile = self
            .repo
            .update_active(user_id, is_active)
            .await?
            .ok_or(Error::profile_not_found(user_id))?;

        info!(
            "profile {user_id} {}",
            if is_active { "activated" } else { "deactivated" }
        );
        Ok(profile)
    }
}

#[injectable(ConversationService)]
pub struct MyConversationService {
    repo: Ref<dyn ConversationRepository>,
    changes: Ref<ChangeFeed>,
}

impl MyConversationService {
    pub fn new(repo: Ref<dyn ConversationRepository>, changes: Ref<ChangeFeed>) -> Self {
        Self { repo, changes }
    }

    /// Stores a new conversation with the welcome message and, optionally, the
    /// patient's or staff member's first message.
    async fn open(
        &self,
        patient_id: Uuid,
        channel: Channel,
        subject: Option<String>,
        first: Option<(Uuid, OutgoingMessage)>,
    ) -> Result<(Conversation, Vec<Message>)> {
        if patient_id.is_nil() {
            return Err(Error::validation("patient id is required"));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();

        let mut messages = vec![NewMessage {
            id: Uuid::new_v4(),
            conversation_id: id,
            sender_id: SYSTEM_SENDER_ID,
            sender_kind: SenderKind::Bot,
            content: WELCOME_MESSAGE.to_owned(),
            message_type: MessageType::Text,
            file_url: None,
            status: MessageStatus::Delivered,
        }];
        if let Some((sender_id, message)) = first {
            messages.push(NewMessage {
                id: Uuid::new_v4(),
                conversation_id: id,
                sender_id,
                sender_kind: SenderKind::Participant,
                content: message.content,
                message_type: message.message_type,
                file_url: message.file_url,
                status: MessageStatus::Sent,
            });
        }

        let (conversation, messages) = self
            .repo
            .create_conversation(
                Conversation {
                    id,
                    patient_id,
                    attendant_id: None,
                    channel,
                    status: ConversationStatus::Open,
                    subject: subject.filter(|subject| !subject.trim().is_empty()),
                    priority: DEFAULT_PRIORITY,
                    started_at: now,
                    last_message_at: now,
                    closed_at: None,
                    rating: None,
                    feedback: None,
                },
                messages,
            )
            .await?;

        info!(
            "conversation {} opened for patient {patient_id} via {channel}",
            conversation.id
        );
        Ok((conversation, messages))
    }

    /// Explains why a conditional update did not apply.
    async fn rejection(&self, conversation_id: Uuid, action: &str) -> Error {
        match self.repo.find_conversation(conversation_id).await {
            Ok(Some(conversation)) if conversation.is_closed() => {
                Error::invalid_state(format!("conversation {conversation_id} is closed"))
            }
            Ok(Some(conversation)) => Error::invalid_state(format!(
                "cannot {action} conversation {conversation_id} while it is {}",
                conversation.status
            )),
            Ok(None) => Error::conversation_not_found(conversation_id),
            Err(err) => err.into(),
        }
    }
}

#[async_trait]
impl ConversationService for MyConversationService {
    async fn list_conversations(&self, role: Role, user_id: Uuid) -> Result<Vec<Conversation>> {
        let repo = &self.repo;
        let filter = scope_for(role, user_id);
        retry_read("list conversations", move || async move {
            Ok::<_, Error>(repo.list_conversations(filter).await?)
        })
        .await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Conversation> {
        let repo = &self.repo;
        retry_read("get conversation", move || async move {
            Ok::<_, Error>(repo.find_conversation(conversation_id).await?)
        })
        .await?
        .ok_or(Error::conversation_not_found(conversation_id))
    }

    async fn create_conversation(
        &self,
        patient_id: Uuid,
        channel: Channel,
        subject: Option<String>,
    ) -> Result<Conversation> {
        let (conversation, _) = self.open(patient_id, channel, subject, None).await?;
        Ok(conversation)
    }

    async fn create_conversation_with_message(
        &self,
        patient_id: Uuid,
        channel: Channel,
        subject: Option<String>,
        sender_id: Uuid,
        message: OutgoingMessage,
    ) -> Result<(Conversation, Message)> {
        validate_outgoing(sender_id, &message)?;

        let (conversation, mut messages) = self
            .open(patient_id, channel, subject, Some((sender_id, message)))
            .await?;
        let first = messages
            .pop()
            .ok_or_else(|| Error::invalid_state("first message was not stored"))?;

        Ok((conversation, first))
    }

    async fn assign_conversation(
        &self,
        conversation_id: Uuid,
        attendant_id: Uuid,
    ) -> Result<Conversation> {
        if attendant_id.is_nil() {
            return Err(Error::validation("attendant id is required"));
        }

        match self
            .repo
            .assign_conversation(conversation_id, attendant_id)
            .await?
        {
            Some(conversation) => {
                info!("conversation {conversation_id} assigned to {attendant_id}");
                Ok(conversation)
            }
            None => Err(self.rejection(conversation_id, "assign").await),
        }
    }

    async fn mark_waiting(&self, conversation_id: Uuid) -> Result<Conversation> {
        match self.repo.mark_waiting(conversation_id).await? {
            Some(conversation) => Ok(conversation),
            None => Err(self.rejection(conversation_id, "park").await),
        }
    }

    async fn close_conversation(
        &self,
        conversation_id: Uuid,
        rating: Option<i64>,
        feedback: Option<String>,
    ) -> Result<Conversation> {
        if rating.is_some_and(|rating| !RATING_RANGE.contains(&rating)) {
            return Err(Error::validation(format!(
                "rating must be between {} and {}",
                RATING_RANGE.start(),
                RATING_RANGE.end()
            )));
        }

        match self
            .repo
            .close_conversation(conversation_id, Utc::now(), rating, feedback)
            .await?
        {
            Some(conversation) => {
                info!("conversation {conversation_id} closed");
                Ok(conversation)
            }
            None => Err(self.rejection(conversation_id, "close").await),
        }
    }

    fn watch_conversations(&self, role: Role, user_id: Uuid) -> ConversationWatch {
        ConversationWatch::new(role, user_id, self.changes.subscribe())
    }
}

#[injectable(MessageService)]
pub struct MyMessageService {
    repo: Ref<dyn MessageRepository>,
    sequencer: Ref<AppendSequencer>,
    subscriptions: Ref<SubscriptionRegistry>,
}

impl MyMessageService {
    pub fn new(
        repo: Ref<dyn MessageRepository>,
        sequencer: Ref<AppendSequencer>,
        subscriptions: Ref<SubscriptionRegistry>,
    ) -> Self {
        Self {
            repo,
            sequencer,
            subscriptions,
        }
    }

    async fn advance(&self, message_id: Uuid, status: MessageStatus) -> Result<Message> {
        if let Some(message) = self
            .repo
            .advance_status(message_id, status, Utc::now())
            .await?
        {
            return Ok(message);
        }

        // already at or past `status`
        self.repo
            .find_message(message_id)
            .await?
            .ok_or(Error::message_not_found(message_id))
    }
}

fn validate_outgoing(sender_id: Uuid, message: &OutgoingMessage) -> Result<()> {
    if sender_id.is_nil() {
        return Err(Error::validation("sender id is required"));
    }

    match message.message_type {
        MessageType::Text if message.content.trim().is_empty() => {
            Err(Error::validation("message content must not be empty"))
        }
        MessageType::File
            if message
                .file_url
                .as_deref()
                .is_none_or(|url| url.trim().is_empty()) =>
        {
            Err(Error::validation("file messages need a file reference"))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl MessageService for MyMessageService {
    async fn fetch_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let repo = &self.repo;
        retry_read("fetch messages", move || async move {
            Ok::<_, Error>(repo.list_messages(conversation_id).await?)
        })
        .await
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Message> {
        let repo = &self.repo;
        retry_read("get message", move || async move {
            Ok::<_, Error>(repo.find_message(message_id).await?)
        })
        .await?
        .ok_or(Error::message_not_found(message_id))
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        message: OutgoingMessage,
    ) -> Result<Message> {
        validate_outgoing(sender_id, &message)?;

        let _lane = self.sequencer.enter(conversation_id).await;

        let outcome = self
            .repo
            .append_message(
                NewMessage {
                    id: Uuid::new_v4(),
                    conversation_id,
                    sender_id,
                    sender_kind: SenderKind::Participant,
                    content: message.content,
                    message_type: message.message_type,
                    file_url: message.file_url,
                    status: MessageStatus::Sent,
                },
                Utc::now(),
            )
            .await?;

        match outcome {
            AppendOutcome::Appended { message, .. } => {
                debug!(
                    "message {} appended to {conversation_id} as #{}",
                    message.id, message.seq
                );
                Ok(message)
            }
            AppendOutcome::ConversationMissing => {
                Err(Error::conversation_not_found(conversation_id))
            }
            AppendOutcome::ConversationClosed => Err(Error::invalid_state(format!(
                "conversation {conversation_id} is closed"
            ))),
        }
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<Message> {
        self.advance(message_id, MessageStatus::Read).await
    }

    async fn mark_delivered(&self, message_id: Uuid) -> Result<Message> {
        self.advance(message_id, MessageStatus::Delivered).await
    }

    fn subscribe(&self, conversation_id: Uuid, listener: Listener) -> SubscriptionHandle {
        self.subscriptions.subscribe(conversation_id, listener)
    }
}
