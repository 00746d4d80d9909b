//! Conversations endpoints

use crate::api::conversations::schemas::{
    AssignConversation, CloseConversation, ConversationList, CreateConversation, CreateMessage,
};
use crate::api::{ApiError, ExtractUser, authorize, require_role};
use crate::core::error::Error;
use crate::core::subscriptions::SubscriptionEvent;
use crate::core::traits::{ConversationService, MessageService, OutgoingMessage, ProfileService};
use crate::core::visibility::is_visible;
use crate::core::watch::ConversationUpdate;
use crate::infrastructure::entities::{self, Channel, MessageType, Role, UserProfile};
use async_stream::stream;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::Sse;
use axum::response::sse::{Event, KeepAlive};
use axum::routing::{get, post};
use axum::{Json, Router};
use di_axum::Inject;
use futures_util::Stream;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

const STAFF: &[Role] = &[Role::Attendant, Role::Manager];

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_conversations).post(new_conversation))
        .route("/events", get(conversation_events))
        .route("/:id", get(get_conversation))
        .route("/:id/assign", post(assign_conversation))
        .route("/:id/waiting", post(mark_waiting))
        .route("/:id/close", post(close_conversation))
        .route(
            "/:id/messages",
            get(conversation_messages).post(post_message),
        )
        .route("/:id/messages/events", get(message_events))
}

/// Loads the conversation, answering `NotFound` when the caller may not see it.
pub(crate) async fn visible_conversation(
    conversation_service: &dyn ConversationService,
    profile: &UserProfile,
    conversation_id: Uuid,
) -> Result<entities::Conversation, ApiError> {
    let conversation = conversation_service
        .get_conversation(conversation_id)
        .await?;

    if is_visible(profile.role, profile.id, &conversation) {
        Ok(conversation)
    } else {
        Err(Error::conversation_not_found(conversation_id).into())
    }
}

async fn list_conversations(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
) -> Result<Json<ConversationList>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;

    let conversations = conversation_service
        .list_conversations(profile.role, profile.id)
        .await?;

    Ok(Json(ConversationList {
        conversations: conversations
            .into_iter()
            .map(schemas::Conversation::from)
            .collect(),
    }))
}

async fn new_conversation(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
    Json(create_conversation): Json<CreateConversation>,
) -> Result<(StatusCode, Json<schemas::Conversation>), ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;

    let patient_id = match (profile.role, create_conversation.patient_id) {
        (Role::Patient, None) => profile.id,
        (Role::Patient, Some(patient_id)) if patient_id == profile.id => patient_id,
        (Role::Patient, Some(_)) => {
            return Err(Error::forbidden("patients open conversations for themselves").into());
        }
        (_, Some(patient_id)) => patient_id,
        (_, None) => return Err(Error::validation("patient_id is required").into()),
    };

    let channel: Channel = create_conversation.channel.parse()?;
    let conversation = match create_conversation.message {
        Some(text) => {
            let (conversation, _) = conversation_service
                .create_conversation_with_message(
                    patient_id,
                    channel,
                    create_conversation.subject,
                    profile.id,
                    OutgoingMessage::text(text),
                )
                .await?;
            conversation
        }
        None => {
            conversation_service
                .create_conversation(patient_id, channel, create_conversation.subject)
                .await?
        }
    };

    Ok((StatusCode::CREATED, Json(conversation.into())))
}

async fn get_conversation(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<schemas::Conversation>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    let conversation =
        visible_conversation(&*conversation_service, &profile, conversation_id).await?;

    Ok(Json(conversation.into()))
}

async fn assign_conversation(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(assign): Json<AssignConversation>,
) -> Result<Json<schemas::Conversation>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    require_role(&profile, STAFF)?;

    let attendant_id = match (profile.role, assign.attendant_id) {
        (Role::Attendant, Some(attendant_id)) if attendant_id != profile.id => {
            return Err(Error::forbidden("attendants can only claim for themselves").into());
        }
        (_, attendant_id) => attendant_id.unwrap_or(profile.id),
    };

    visible_conversation(&*conversation_service, &profile, conversation_id).await?;
    let conversation = conversation_service
        .assign_conversation(conversation_id, attendant_id)
        .await?;

    Ok(Json(conversation.into()))
}

async fn mark_waiting(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<schemas::Conversation>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    require_role(&profile, STAFF)?;

    visible_conversation(&*conversation_service, &profile, conversation_id).await?;
    let conversation = conversation_service.mark_waiting(conversation_id).await?;

    Ok(Json(conversation.into()))
}

async fn close_conversation(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(close): Json<CloseConversation>,
) -> Result<Json<schemas::Conversation>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;

    visible_conversation(&*conversation_service, &profile, conversation_id).await?;
    let conversation = conversation_service
        .close_conversation(conversation_id, close.rating, close.feedback)
        .await?;

    Ok(Json(conversation.into()))
}

async fn conversation_events(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    ExtractUser(identity): ExtractUser,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    let mut watch = conversation_service.watch_conversations(profile.role, profile.id);

    let stream = stream! {
        while let Some(update) = watch.next().await {
            match update {
                ConversationUpdate::Changed(conversation) => {
                    yield Event::default()
                        .event("conversation")
                        .json_data(schemas::Conversation::from(conversation));
                }
                ConversationUpdate::Resync => {
                    yield Ok(Event::default().event("resync").data("{}"));
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn conversation_messages(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(message_service): Inject<dyn MessageService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<schemas::MessagesList>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    visible_conversation(&*conversation_service, &profile, conversation_id).await?;

    let messages = message_service.fetch_messages(conversation_id).await?;

    Ok(Json(schemas::MessagesList {
        messages: messages.into_iter().map(schemas::Message::from).collect(),
    }))
}

async fn post_message(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(message_service): Inject<dyn MessageService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
    Json(message): Json<CreateMessage>,
) -> Result<(StatusCode, Json<schemas::Message>), ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    visible_conversation(&*conversation_service, &profile, conversation_id).await?;

    let message_type = match message.message_type.as_deref() {
        Some(message_type) => message_type.parse()?,
        None => MessageType::Text,
    };

    let message = message_service
        .send_message(
            conversation_id,
            profile.id,
            OutgoingMessage {
                content: message.content,
                message_type,
                file_url: message.file_url,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(message.into())))
}

async fn message_events(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(message_service): Inject<dyn MessageService>,
    ExtractUser(identity): ExtractUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    visible_conversation(&*conversation_service, &profile, conversation_id).await?;

    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handle = message_service.subscribe(
        conversation_id,
        Box::new(move |event: SubscriptionEvent<'_>| {
            let event = match event {
                SubscriptionEvent::Message(message) => Event::default()
                    .event("message")
                    .json_data(schemas::Message::from(message.clone())),
                SubscriptionEvent::Resync => Ok(Event::default().event("resync").data("{}")),
            };
            // the client went away, the handle is released with the stream
            let _ = sender.send(event);
        }),
    );

    let stream = stream! {
        while let Some(event) = receiver.recv().await {
            yield event;
        }
        debug!("message stream for {} ended", handle.conversation_id());
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub mod schemas {
    use crate::infrastructure::entities;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize, Debug)]
    pub struct CreateConversation {
        pub channel: String,
        #[serde(default)]
        pub subject: Option<String>,
        /// Only staff may open a conversation on behalf of a patient.
        #[serde(default)]
        pub patient_id: Option<Uuid>,
        /// Optional first message from the caller.
        #[serde(default)]
        pub message: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct Conversation {
        pub id: Uuid,
        pub patient_id: Uuid,
        pub attendant_id: Option<Uuid>,
        pub channel: &'static str,
        pub status: &'static str,
        pub subject: Option<String>,
        pub priority: i64,
        pub started_at: DateTime<Utc>,
        pub last_message_at: DateTime<Utc>,
        pub closed_at: Option<DateTime<Utc>>,
        pub rating: Option<i64>,
        pub feedback: Option<String>,
    }

    impl From<entities::Conversation> for Conversation {
        fn from(conversation: entities::Conversation) -> Self {
            Conversation {
                id: conversation.id,
                patient_id: conversation.patient_id,
                attendant_id: conversation.attendant_id,
                channel: conversation.channel.as_str(),
                status: conversation.status.as_str(),
                subject: conversation.subject,
                priority: conversation.priority,
                started_at: conversation.started_at,
                last_message_at: conversation.last_message_at,
                closed_at: conversation.closed_at,
                rating: conversation.rating,
                feedback: conversation.feedback,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ConversationList {
        pub conversations: Vec<Conversation>,
    }

    #[derive(Serialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<Message>,
    }

    #[derive(Serialize, Debug)]
    #[serde(rename_all = "lowercase")]
    pub enum SenderKind {
        Bot,
        Participant,
    }

    impl From<entities::SenderKind> for SenderKind {
        fn from(kind: entities::SenderKind) -> Self {
            match kind {
                entities::SenderKind::Bot => SenderKind::Bot,
                entities::SenderKind::Participant => SenderKind::Participant,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct Message {
        pub conversation_id: Uuid,
        pub id: Uuid,
        pub seq: i64,
        pub sender_id: Uuid,
        pub sender_kind: SenderKind,
        pub content: String,
        pub message_type: &'static str,
        pub file_url: Option<String>,
        pub status: &'static str,
        pub read_at: Option<DateTime<Utc>>,
        pub created_at: DateTime<Utc>,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                conversation_id: message.conversation_id,
                id: message.id,
                seq: message.seq,
                sender_id: message.sender_id,
                sender_kind: message.sender_kind.into(),
                content: message.content,
                message_type: message.message_type.as_str(),
                file_url: message.file_url,
                status: message.status.as_str(),
                read_at: message.read_at,
                created_at: message.created_at,
            }
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct CreateMessage {
        #[serde(default)]
        pub content: String,
        #[serde(default)]
        pub message_type: Option<String>,
        #[serde(default)]
        pub file_url: Option<String>,
    }

    #[derive(Deserialize, Debug, Default)]
    pub struct AssignConversation {
        #[serde(default)]
        pub attendant_id: Option<Uuid>,
    }

    #[derive(Deserialize, Debug, Default)]
    pub struct CloseConversation {
        #[serde(default)]
        pub rating: Option<i64>,
        #[serde(default)]
        pub feedback: Option<String>,
    }
}
