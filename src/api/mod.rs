use crate::core::error::Error;
use crate::core::identity::Identity;
use crate::core::traits::ProfileService;
use crate::infrastructure::entities::{Role, UserProfile};
use async_trait::async_trait;
use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use log::error;
use serde::Serialize;
use std::str::FromStr;
use uuid::Uuid;

pub mod conversations;
pub mod messages;
pub mod profiles;

const X_USER_ID: &str = "X-User-ID";
const X_USER_HANDLE: &str = "X-User-Handle";

#[derive(Debug)]
pub struct ExtractUser(pub Identity);

#[async_trait]
impl<S> FromRequestParts<S> for ExtractUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, (StatusCode, &'static str)> {
        if let Some(user_id) = parts.headers.get(X_USER_ID) {
            let user_id = user_id
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user id"))?;
            let user_id = Uuid::from_str(user_id)
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user id"))?;

            let mut identity = Identity::new(user_id);
            if let Some(handle) = parts
                .headers
                .get(X_USER_HANDLE)
                .and_then(|handle| handle.to_str().ok())
                .filter(|handle| !handle.is_empty())
            {
                identity = identity.with_handle(handle);
            }

            Ok(ExtractUser(identity))
        } else {
            Err((StatusCode::BAD_REQUEST, "`X-User-ID` header is missing"))
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorInformation {
    pub error: &'static str,
    pub message: String,
}

/// Core error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "Validation"),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, "Forbidden"),
            Error::NotFound { .. } => (StatusCode::NOT_FOUND, "NotFound"),
            Error::InvalidState(_) => (StatusCode::CONFLICT, "InvalidState"),
            Error::Store(err) => {
                error!("request failed: {err}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Store")
            }
        };

        (
            status,
            Json(ErrorInformation {
                error: kind,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Loads the caller's profile, creating it on first contact, and rejects
/// deactivated users.
pub async fn authorize(
    profiles: &dyn ProfileService,
    identity: &Identity,
) -> Result<UserProfile, ApiError> {
    let profile = profiles.load_or_create(identity).await?;
    if !profile.is_active {
        return Err(Error::forbidden(format!("profile {} is deactivated", profile.id)).into());
    }
    Ok(profile)
}

pub fn require_role(profile: &UserProfile, allowed: &[Role]) -> Result<(), ApiError> {
    if allowed.contains(&profile.role) {
        Ok(())
    } else {
        Err(Error::forbidden(format!("not allowed for role {}", profile.role)).into())
    }
}
