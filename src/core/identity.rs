//! Identity of the signed in user and the session glue that keeps a profile
//! loaded for it.

use crate::core::traits::ProfileService;
use crate::infrastructure::entities::UserProfile;
use di::Ref;
use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    /// E-mail address or handle, if the provider knows one.
    pub handle: Option<String>,
}

impl Identity {
    pub fn new(id: Uuid) -> Self {
        Self { id, handle: None }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

/// Source of the current identity, e.g. an authentication service session.
pub trait IdentityProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;

    /// Receiver that changes on every login and logout.
    fn identity_changes(&self) -> watch::Receiver<Option<Identity>>;
}

/// In-process session holding at most one signed in identity.
pub struct SessionIdentity {
    current: watch::Sender<Option<Identity>>,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionIdentity {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    pub fn sign_in(&self, identity: Identity) {
        self.current.send_replace(Some(identity));
    }

    pub fn sign_out(&self) {
        self.current.send_replace(None);
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_identity(&self) -> Option<Identity> {
        self.current.borrow().clone()
    }

    fn identity_changes(&self) -> watch::Receiver<Option<Identity>> {
        self.current.subscribe()
    }
}

/// Keeps the signed in user's profile loaded: on login the profile is loaded
/// (or created on first login), on logout it is cleared.
pub fn follow_profile(
    provider: &dyn IdentityProvider,
    profiles: Ref<dyn ProfileService>,
) -> (watch::Receiver<Option<UserProfile>>, JoinHandle<()>) {
    let (profile_tx, profile_rx) = watch::channel(None);
    let mut changes = provider.identity_changes();

    let task = tokio::spawn(async move {
        loop {
            let identity = changes.borrow_and_update().clone();

            let profile = match identity {
                Some(identity) => match profiles.load_or_create(&identity).await {
                    Ok(profile) => {
                        info!("session profile loaded for {}", profile.id);
                        Some(profile)
                    }
                    Err(err) => {
                        error!("failed to load profile for {}: {err}", identity.id);
                        None
                    }
                },
                None => None,
            };

            if profile_tx.send(profile).is_err() {
                return;
            }

            if changes.changed().await.is_err() {
                return;
            }
        }
    });

    (profile_rx, task)
}
