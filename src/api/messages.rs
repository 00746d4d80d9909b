//! Delivery receipts

use crate::api::conversations::{schemas, visible_conversation};
use crate::api::{ApiError, ExtractUser, authorize};
use crate::core::traits::{ConversationService, MessageService, ProfileService};
use axum::extract::Path;
use axum::routing::post;
use axum::{Json, Router};
use di_axum::Inject;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/:id/read", post(mark_read))
        .route("/:id/delivered", post(mark_delivered))
}

async fn mark_read(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(message_service): Inject<dyn MessageService>,
    ExtractUser(identity): ExtractUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<schemas::Message>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    let message = message_service.get_message(message_id).await?;
    visible_conversation(&*conversation_service, &profile, message.conversation_id).await?;

    let message = message_service.mark_read(message_id).await?;
    Ok(Json(message.into()))
}

async fn mark_delivered(
    Inject(profile_service): Inject<dyn ProfileService>,
    Inject(conversation_service): Inject<dyn ConversationService>,
    Inject(message_service): Inject<dyn MessageService>,
    ExtractUser(identity): ExtractUser,
    Path(message_id): Path<Uuid>,
) -> Result<Json<schemas::Message>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    let message = message_service.get_message(message_id).await?;
    visible_conversation(&*conversation_service, &profile, message.conversation_id).await?;

    let message = message_service.mark_delivered(message_id).await?;
    Ok(Json(message.into()))
}
