//! Error taxonomy of the messaging core

use crate::infrastructure::entities::UnknownVariant;
use crate::infrastructure::traits::StoreError;
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing input.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    /// The operation is not legal in the entity's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Backend failure. Reads may be retried, writes are surfaced as-is.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn conversation_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "conversation",
            id,
        }
    }

    pub fn message_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "message",
            id,
        }
    }

    pub fn profile_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "profile",
            id,
        }
    }
}

impl From<UnknownVariant> for Error {
    fn from(err: UnknownVariant) -> Self {
        Self::Validation(err.to_string())
    }
}
