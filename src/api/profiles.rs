//! Profile endpoints

use crate::api::{ApiError, ExtractUser, authorize, require_role};
use crate::core::traits::ProfileService;
use crate::infrastructure::entities::{Role, UserProfile};
use axum::extract::Path;
use axum::routing::{get, put};
use axum::{Json, Router};
use di_axum::Inject;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_profiles))
        .route("/me", get(my_profile))
        .route("/:id/role", put(set_role))
        .route("/:id/active", put(set_active))
}

async fn my_profile(
    Inject(profile_service): Inject<dyn ProfileService>,
    ExtractUser(identity): ExtractUser,
) -> Result<Json<schemas::Profile>, ApiError> {
    let profile = authorize(&*profile_service, &identity).await?;
    Ok(Json(profile.into()))
}

async fn list_profiles(
    Inject(profile_service): Inject<dyn ProfileService>,
    ExtractUser(identity): ExtractUser,
) -> Result<Json<schemas::ProfileList>, ApiError> {
    let caller = authorize(&*profile_service, &identity).await?;
    require_role(&caller, &[Role::Manager])?;

    let profiles = profile_service.list_profiles().await?;
    Ok(Json(schemas::ProfileList {
        profiles: profiles.into_iter().map(schemas::Profile::from).collect(),
    }))
}

async fn set_role(
    Inject(profile_service): Inject<dyn ProfileService>,
    ExtractUser(identity): ExtractUser,
    Path(user_id): Path<Uuid>,
    Json(update): Json<schemas::UpdateRole>,
) -> Result<Json<schemas::Profile>, ApiError> {
    let caller = authorize(&*profile_service, &identity).await?;
    require_role(&caller, &[Role::Manager])?;

    let role: Role = update.role.parse()?;
    let profile: UserProfile = profile_service.set_role(user_id, role).await?;
    Ok(Json(profile.into()))
}

async fn set_active(
    Inject(profile_service): Inject<dyn ProfileService>,
    ExtractUser(identity): ExtractUser,
    Path(user_id): Path<Uuid>,
    Json(update): Json<schemas::UpdateActive>,
) -> Result<Json<schemas::Profile>, ApiError> {
    let caller = authorize(&*profile_service, &identity).await?;
    require_role(&caller, &[Role::Manager])?;

    let profile = profile_service
        .set_active(user_id, update.is_active)
        .await?;
    Ok(Json(profile.into()))
}

pub mod schemas {
    use crate::infrastructure::entities;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Serialize, Debug)]
    pub struct Profile {
        pub id: Uuid,
        pub role: &'static str,
        pub full_name: Option<String>,
        pub is_active: bool,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl From<entities::UserProfile> for Profile {
        fn from(profile: entities::UserProfile) -> Self {
            Profile {
                id: profile.id,
                role: profile.role.as_str(),
                full_name: profile.full_name,
                is_active: profile.is_active,
                created_at: profile.created_at,
                updated_at: profile.updated_at,
            }
        }
    }

    #[derive(Serialize, Debug)]
    pub struct ProfileList {
        pub profiles: Vec<Profile>,
    }

    #[derive(Deserialize, Debug)]
    pub struct UpdateRole {
        pub role: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct UpdateActive {
        pub is_active: bool,
    }
}
