//! DB Repository abstractions

use crate::infrastructure::changes::{ChangeEvent, ChangeFeed};
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{
    Conversation, ConversationStatus, Message, MessageStatus, NewMessage, Role, UserProfile,
};
use crate::infrastructure::traits::{
    AppendOutcome, ConversationFilter, ConversationRepository, MessageRepository,
    ProfileRepository, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use di::{Ref, injectable};
use log::error;
use uuid::Uuid;

const INSERT_MESSAGE: &str = "INSERT INTO messages (id, conversation_id, seq, sender_id, sender_kind, content, message_type, file_url, status, created_at) \
     VALUES (?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?), ?, ?, ?, ?, ?, ?, ?) RETURNING *";

// keep in sync with the declaration order of `MessageStatus`
const STATUS_RANK: &str =
    "CASE status WHEN 'sent' THEN 0 WHEN 'delivered' THEN 1 WHEN 'read' THEN 2 ELSE 3 END";

fn logged(e: sqlx::Error) -> StoreError {
    error!("{e}");
    StoreError::from(e)
}

#[injectable(ProfileRepository)]
pub struct DbProfileRepository {
    connection: Ref<DatabaseConnection>,
}

impl DbProfileRepository {
    pub fn new(connection: Ref<DatabaseConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ProfileRepository for DbProfileRepository {
    async fn find_profile(&self, id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        sqlx::query_as("SELECT * FROM user_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged)
    }

    async fn insert_profile_if_absent(
        &self,
        profile: UserProfile,
    ) -> Result<UserProfile, StoreError> {
        sqlx::query(
            "INSERT INTO user_profiles (id, role, full_name, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(profile.id)
        .bind(profile.role)
        .bind(&profile.full_name)
        .bind(profile.is_active)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&**self.connection)
        .await
        .map_err(logged)?;

        sqlx::query_as("SELECT * FROM user_profiles WHERE id = ?")
            .bind(profile.id)
            .fetch_one(&**self.connection)
            .await
            .map_err(logged)
    }

    async fn list_profiles(&self) -> Result<Vec<UserProfile>, StoreError> {
        sqlx::query_as("SELECT * FROM user_profiles ORDER BY created_at DESC")
            .fetch_all(&**self.connection)
            .await
            .map_err(logged)
    }

    async fn update_role(&self, id: Uuid, role: Role) -> Result<Option<UserProfile>, StoreError> {
        sqlx::query_as("UPDATE user_profiles SET role = ?, updated_at = ? WHERE id = ? RETURNING *")
            .bind(role)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged)
    }

    async fn update_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<Option<UserProfile>, StoreError> {
        sqlx::query_as(
            "UPDATE user_profiles SET is_active = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(is_active)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&**self.connection)
        .await
        .map_err(logged)
    }
}

#[injectable(ConversationRepository)]
pub struct DbConversationRepository {
    connection: Ref<DatabaseConnection>,
    changes: Ref<ChangeFeed>,
}

impl DbConversationRepository {
    pub fn new(connection: Ref<DatabaseConnection>, changes: Ref<ChangeFeed>) -> Self {
        Self {
            connection,
            changes,
        }
    }

    fn published(&self, conversation: Option<Conversation>) -> Option<Conversation> {
        if let Some(conversation) = &conversation {
            self.changes
                .publish(ChangeEvent::ConversationChanged(conversation.clone()));
        }
        conversation
    }
}

#[async_trait]
impl ConversationRepository for DbConversationRepository {
    async fn list_conversations(
        &self,
        filter: ConversationFilter,
    ) -> Result<Vec<Conversation>, StoreError> {
        let (sql, user_id) = match filter {
            ConversationFilter::Patient(patient_id) => (
                "SELECT * FROM conversations WHERE patient_id = ? ORDER BY last_message_at DESC, started_at DESC",
                Some(patient_id),
            ),
            ConversationFilter::AttendantQueue(attendant_id) => (
                "SELECT * FROM conversations WHERE attendant_id = ? OR attendant_id IS NULL ORDER BY last_message_at DESC, started_at DESC",
                Some(attendant_id),
            ),
            ConversationFilter::All => (
                "SELECT * FROM conversations ORDER BY last_message_at DESC, started_at DESC",
                None,
            ),
        };

        let mut query = sqlx::query_as(sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }

        query.fetch_all(&**self.connection).await.map_err(logged)
    }

    async fn find_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        sqlx::query_as("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged)
    }

    async fn create_conversation(
        &self,
        conversation: Conversation,
        messages: Vec<NewMessage>,
    ) -> Result<(Conversation, Vec<Message>), StoreError> {
        let mut tx = self.connection.begin().await.map_err(logged)?;

        let conversation: Conversation = sqlx::query_as(
            "INSERT INTO conversations (id, patient_id, attendant_id, channel, status, subject, priority, started_at, last_message_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(conversation.id)
        .bind(conversation.patient_id)
        .bind(conversation.attendant_id)
        .bind(conversation.channel)
        .bind(conversation.status)
        .bind(&conversation.subject)
        .bind(conversation.priority)
        .bind(conversation.started_at)
        .bind(conversation.last_message_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(logged)?;

        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            let message: Message = sqlx::query_as(INSERT_MESSAGE)
                .bind(message.id)
                .bind(conversation.id)
                .bind(conversation.id)
                .bind(message.sender_id)
                .bind(message.sender_kind)
                .bind(message.content)
                .bind(message.message_type)
                .bind(message.file_url)
                .bind(message.status)
                .bind(conversation.last_message_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(logged)?;
            inserted.push(message);
        }

        tx.commit().await.map_err(logged)?;

        self.changes
            .publish(ChangeEvent::ConversationChanged(conversation.clone()));
        for message in &inserted {
            self.changes
                .publish(ChangeEvent::MessageInserted(message.clone()));
        }

        Ok((conversation, inserted))
    }

    async fn assign_conversation(
        &self,
        conversation_id: Uuid,
        attendant_id: Uuid,
    ) -> Result<Option<Conversation>, StoreError> {
        let assigned = sqlx::query_as(
            "UPDATE conversations SET attendant_id = ? WHERE id = ? AND status IN ('open', 'waiting') RETURNING *",
        )
        .bind(attendant_id)
        .bind(conversation_id)
        .fetch_optional(&**self.connection)
        .await
        .map_err(logged)?;

        Ok(self.published(assigned))
    }

    async fn mark_waiting(&self, conversation_id: Uuid) -> Result<Option<Conversation>, StoreError> {
        let waiting = sqlx::query_as(
            "UPDATE conversations SET status = ? WHERE id = ? AND status = ? RETURNING *",
        )
        .bind(ConversationStatus::Waiting)
        .bind(conversation_id)
        .bind(ConversationStatus::Open)
        .fetch_optional(&**self.connection)
        .await
        .map_err(logged)?;

        Ok(self.published(waiting))
    }

    async fn close_conversation(
        &self,
        conversation_id: Uuid,
        closed_at: DateTime<Utc>,
        rating: Option<i64>,
        feedback: Option<String>,
    ) -> Result<Option<Conversation>, StoreError> {
        let closed = sqlx::query_as(
            "UPDATE conversations SET status = ?, closed_at = ?, rating = ?, feedback = ? WHERE id = ? AND status != ? RETURNING *",
        )
        .bind(ConversationStatus::Closed)
        .bind(closed_at)
        .bind(rating)
        .bind(feedback)
        .bind(conversation_id)
        .bind(ConversationStatus::Closed)
        .fetch_optional(&**self.connection)
        .await
        .map_err(logged)?;

        Ok(self.published(closed))
    }
}

#[injectable(MessageRepository)]
pub struct DbMessageRepository {
    connection: Ref<DatabaseConnection>,
    changes: Ref<ChangeFeed>,
}

impl DbMessageRepository {
    pub fn new(connection: Ref<DatabaseConnection>, changes: Ref<ChangeFeed>) -> Self {
        Self {
            connection,
            changes,
        }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, StoreError> {
        sqlx::query_as(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&**self.connection)
        .await
        .map_err(logged)
    }

    async fn find_message(&self, message_id: Uuid) -> Result<Option<Message>, StoreError> {
        sqlx::query_as("SELECT * FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged)
    }

    async fn append_message(
        &self,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tx = self.connection.begin().await.map_err(logged)?;

        // Writing first takes the database write lock, and the status guard makes
        // the closed check and the activity bump a single step.
        let conversation: Option<Conversation> = sqlx::query_as(
            "UPDATE conversations SET last_message_at = MAX(last_message_at, ?) WHERE id = ? AND status != ? RETURNING *",
        )
        .bind(now)
        .bind(message.conversation_id)
        .bind(ConversationStatus::Closed)
        .fetch_optional(&mut *tx)
        .await
        .map_err(logged)?;

        let Some(conversation) = conversation else {
            let existing: Option<(ConversationStatus,)> =
                sqlx::query_as("SELECT status FROM conversations WHERE id = ?")
                    .bind(message.conversation_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(logged)?;
            tx.rollback().await.map_err(logged)?;

            return Ok(match existing {
                Some(_) => AppendOutcome::ConversationClosed,
                None => AppendOutcome::ConversationMissing,
            });
        };

        // never earlier than anything already in the conversation
        let created_at = conversation.last_message_at;

        let message: Message = sqlx::query_as(INSERT_MESSAGE)
            .bind(message.id)
            .bind(message.conversation_id)
            .bind(message.conversation_id)
            .bind(message.sender_id)
            .bind(message.sender_kind)
            .bind(message.content)
            .bind(message.message_type)
            .bind(message.file_url)
            .bind(message.status)
            .bind(created_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(logged)?;

        tx.commit().await.map_err(logged)?;

        self.changes
            .publish(ChangeEvent::MessageInserted(message.clone()));
        self.changes
            .publish(ChangeEvent::ConversationChanged(conversation.clone()));

        Ok(AppendOutcome::Appended {
            message,
            conversation,
        })
    }

    async fn advance_status(
        &self,
        message_id: Uuid,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        let read_at = (status >= MessageStatus::Read).then_some(at);

        let sql = format!(
            "UPDATE messages SET status = ?, read_at = COALESCE(read_at, ?) WHERE id = ? AND {STATUS_RANK} < ? RETURNING *"
        );

        let advanced: Option<Message> = sqlx::query_as(&sql)
            .bind(status)
            .bind(read_at)
            .bind(message_id)
            .bind(status as i64)
            .fetch_optional(&**self.connection)
            .await
            .map_err(logged)?;

        if let Some(message) = &advanced {
            self.changes
                .publish(ChangeEvent::MessageUpdated(message.clone()));
        }

        Ok(advanced)
    }
}
