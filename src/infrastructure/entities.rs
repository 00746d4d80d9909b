//! Database entities

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Raised when a textual enum value coming from a client is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a text-backed enum together with its wire names.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
        #[sqlx(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant {
                        kind: $kind,
                        value: s.to_owned(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Role of an authenticated user.
    Role, "role" {
        Patient => "patient",
        Attendant => "attendant",
        Manager => "manager",
    }
);

text_enum!(
    /// Inbound channel a conversation originated from.
    Channel, "channel" {
        Whatsapp => "whatsapp",
        Instagram => "instagram",
        Facebook => "facebook",
        Email => "email",
        Site => "site",
    }
);

text_enum!(
    ConversationStatus, "conversation status" {
        Open => "open",
        Waiting => "waiting",
        Closed => "closed",
    }
);

text_enum!(
    MessageType, "message type" {
        Text => "text",
        File => "file",
    }
);

text_enum!(
    /// Delivery status of a message. Variants are declared in delivery order,
    /// so the derived ordering is the order in which a message may advance.
    #[derive(PartialOrd, Ord)]
    MessageStatus, "message status" {
        Sent => "sent",
        Delivered => "delivered",
        Read => "read",
        Replied => "replied",
    }
);

#[derive(Debug, Clone, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub role: Role,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub attendant_id: Option<Uuid>,
    pub channel: Channel,
    pub status: ConversationStatus,
    pub subject: Option<String>,
    pub priority: i64,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub rating: Option<i64>,
    pub feedback: Option<String>,
}

impl Conversation {
    pub fn is_closed(&self) -> bool {
        self.status == ConversationStatus::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(u8)]
pub enum SenderKind {
    Bot = 1,
    Participant = 2,
}

#[derive(Debug, Clone, FromRow)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub seq: i64,
    pub sender_id: Uuid,
    pub sender_kind: SenderKind,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub status: MessageStatus,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Total order of messages inside a conversation.
    pub fn ordering_key(&self) -> (DateTime<Utc>, i64) {
        (self.created_at, self.seq)
    }
}

/// A message that has not been appended yet; `seq` and `created_at` are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_kind: SenderKind,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub status: MessageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_channels() {
        assert_eq!(Channel::from_str("site"), Ok(Channel::Site));
        assert_eq!(Channel::from_str("whatsapp"), Ok(Channel::Whatsapp));
    }

    #[test]
    fn rejects_unknown_channel() {
        let err = Channel::from_str("telegram").unwrap_err();
        assert_eq!(err.kind, "channel");
        assert_eq!(err.to_string(), "unknown channel `telegram`");
    }

    #[test]
    fn message_status_follows_delivery_order() {
        assert!(MessageStatus::Sent < MessageStatus::Delivered);
        assert!(MessageStatus::Delivered < MessageStatus::Read);
        assert!(MessageStatus::Read < MessageStatus::Replied);
    }

    #[test]
    fn role_display_matches_stored_text() {
        assert_eq!(Role::Attendant.to_string(), "attendant");
        assert_eq!(Role::from_str("manager"), Ok(Role::Manager));
    }
}
