pub mod error;
pub mod identity;
pub mod retry;
pub mod sequencer;
pub mod services;
pub mod subscriptions;
pub mod traits;
pub mod visibility;
pub mod watch;
