use chrono::{DateTime, Utc};
use mycelix_core::{MailAddress, Message};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire envelope pushed to connected clients: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    Connected { message: String },
    NewEmail { email: EmailSummary },
    EmailRead { email_id: Uuid, is_read: bool },
}

impl RealtimeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::NewEmail { .. } => "new_email",
            Self::EmailRead { .. } => "email_read",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailSummary {
    pub id: Uuid,
    pub account_id: Uuid,
    pub folder_id: Uuid,
    pub subject: String,
    pub from: MailAddress,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub has_attachments: bool,
}

impl From<&Message> for EmailSummary {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            account_id: message.account_id,
            folder_id: message.folder_id,
            subject: message.subject.clone(),
            from: message.from.clone(),
            sent_at: message.sent_at,
            is_read: message.is_read,
            is_starred: message.is_starred,
            has_attachments: message.has_attachments(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RealtimeEvent;
    use uuid::Uuid;

    #[test]
    fn serializes_as_type_and_data() {
        let id = Uuid::nil();
        let event = RealtimeEvent::EmailRead {
            email_id: id,
            is_read: true,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "email_read");
        assert_eq!(value["data"]["email_id"], id.to_string());
        assert_eq!(value["data"]["is_read"], true);
        assert_eq!(event.name(), "email_read");
    }
}
