//! Role based conversation visibility.
//!
//! Every place that decides whether a caller may see a conversation goes
//! through [`scope_for`], so listing, single lookups, message access and the
//! change stream all agree.

use crate::infrastructure::entities::{Conversation, Role};
use crate::infrastructure::traits::ConversationFilter;
use uuid::Uuid;

/// Conversations visible to `user_id` acting as `role`.
pub fn scope_for(role: Role, user_id: Uuid) -> ConversationFilter {
    match role {
        Role::Patient => ConversationFilter::Patient(user_id),
        Role::Attendant => ConversationFilter::AttendantQueue(user_id),
        Role::Manager => ConversationFilter::All,
    }
}

pub fn is_visible(role: Role, user_id: Uuid, conversation: &Conversation) -> bool {
    scope_for(role, user_id).admits(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::entities::{Channel, ConversationStatus};
    use chrono::Utc;

    fn conversation(patient_id: Uuid, attendant_id: Option<Uuid>) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            patient_id,
            attendant_id,
            channel: Channel::Site,
            status: ConversationStatus::Open,
            subject: None,
            priority: 1,
            started_at: now,
            last_message_at: now,
            closed_at: None,
            rating: None,
            feedback: None,
        }
    }

    #[test]
    fn patient_sees_only_own_conversations() {
        let patient = Uuid::new_v4();
        assert!(is_visible(Role::Patient, patient, &conversation(patient, None)));
        assert!(!is_visible(
            Role::Patient,
            patient,
            &conversation(Uuid::new_v4(), None)
        ));
    }

    #[test]
    fn attendant_sees_own_and_unassigned() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let patient = Uuid::new_v4();

        assert!(is_visible(Role::Attendant, me, &conversation(patient, None)));
        assert!(is_visible(Role::Attendant, me, &conversation(patient, Some(me))));
        assert!(!is_visible(
            Role::Attendant,
            me,
            &conversation(patient, Some(other))
        ));
    }

    #[test]
    fn manager_sees_everything() {
        let manager = Uuid::new_v4();
        assert!(is_visible(
            Role::Manager,
            manager,
            &conversation(Uuid::new_v4(), Some(Uuid::new_v4()))
        ));
        assert_eq!(scope_for(Role::Manager, manager), ConversationFilter::All);
    }
}
