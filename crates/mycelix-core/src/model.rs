use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Archive,
    Custom,
}

impl FolderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Spam => "spam",
            Self::Archive => "archive",
            Self::Custom => "custom",
        }
    }

    /// System folders are provisioned with the account and cannot be deleted.
    pub fn is_system(&self) -> bool {
        !matches!(self, Self::Custom)
    }
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FolderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "inbox" => Ok(Self::Inbox),
            "sent" => Ok(Self::Sent),
            "drafts" => Ok(Self::Drafts),
            "trash" => Ok(Self::Trash),
            "spam" => Ok(Self::Spam),
            "archive" => Ok(Self::Archive),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown folder kind `{other}`")),
        }
    }
}

/// Connection parameters for one protocol side of an account. The password is
/// stored as an opaque ciphertext blob.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub username: String,
    pub password_encrypted: String,
}

impl fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password_encrypted", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email_address: String,
    pub provider: String,
    pub imap: ServerSettings,
    pub smtp: ServerSettings,
    pub is_default: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub path: String,
    pub kind: FolderKind,
    pub unread_count: u32,
    pub total_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl MailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
        }
    }

    /// The domain part of the address, lowercased.
    pub fn domain(&self) -> Option<String> {
        self.address
            .split_once('@')
            .map(|(_, domain)| domain.to_lowercase())
            .filter(|domain| !domain.is_empty())
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAttachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// Referenced from HTML bodies as `cid:<content_id>`.
    pub content_id: Option<String>,
}

/// Output of the MIME decoder, before it is tied to a folder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodedMessage {
    pub message_id: String,
    pub subject: String,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub sent_at: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub size: u64,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub account_id: Uuid,
    pub folder_id: Uuid,
    pub message_id: String,
    pub subject: String,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub size: u64,
    pub is_read: bool,
    pub is_starred: bool,
    pub attachments: Vec<MailAttachment>,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Builds an unread, unstarred row for a freshly decoded message.
    pub fn from_decoded(account_id: Uuid, folder_id: Uuid, decoded: DecodedMessage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            folder_id,
            message_id: decoded.message_id,
            subject: decoded.subject,
            from: decoded.from,
            to: decoded.to,
            cc: decoded.cc,
            bcc: decoded.bcc,
            reply_to: decoded.reply_to,
            body_text: decoded.body_text,
            body_html: decoded.body_html,
            size: decoded.size,
            is_read: false,
            is_starred: false,
            attachments: decoded.attachments,
            sent_at: decoded.sent_at,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult<T> {
    pub total: usize,
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_kind_round_trips_through_str() {
        for kind in [
            FolderKind::Inbox,
            FolderKind::Sent,
            FolderKind::Drafts,
            FolderKind::Trash,
            FolderKind::Spam,
            FolderKind::Archive,
            FolderKind::Custom,
        ] {
            assert_eq!(kind.as_str().parse::<FolderKind>(), Ok(kind));
        }
        assert!("outbox".parse::<FolderKind>().is_err());
    }

    #[test]
    fn only_custom_folders_are_user_managed() {
        assert!(FolderKind::Sent.is_system());
        assert!(!FolderKind::Custom.is_system());
    }

    #[test]
    fn server_settings_debug_hides_password() {
        let settings = ServerSettings {
            host: "imap.example.com".to_string(),
            port: 993,
            secure: true,
            username: "bob".to_string(),
            password_encrypted: "ciphertext".to_string(),
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("ciphertext"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn address_display_and_domain() {
        let addr = MailAddress::named("Alice", "alice@Example.COM");
        assert_eq!(addr.to_string(), "Alice <alice@Example.COM>");
        assert_eq!(addr.domain().as_deref(), Some("example.com"));
        assert_eq!(MailAddress::new("nobody").domain(), None);
    }
}
