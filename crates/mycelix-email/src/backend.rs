use crate::EmailError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lettre::message::{header, Attachment, Mailbox, MultiPart, SinglePart};
use lettre::{
    transport::smtp::authentication::Credentials, AsyncSmtpTransport, AsyncTransport, Message,
    Tokio1Executor,
};
use mycelix_core::{MailAddress, ServerSettings};
use mycelix_security::SecretCipher;
use std::ops::RangeInclusive;
use tokio::task;
use uuid::Uuid;

/// Decrypted connection parameters for one protocol side of an account.
#[derive(Clone)]
pub struct ServerCredentials {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl ServerCredentials {
    pub fn decrypt(
        settings: &ServerSettings,
        cipher: &dyn SecretCipher,
    ) -> Result<Self, EmailError> {
        Ok(Self {
            host: settings.host.clone(),
            port: settings.port,
            secure: settings.secure,
            username: settings.username.clone(),
            password: cipher.decrypt(&settings.password_encrypted)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub sequence: u32,
    pub bytes: Vec<u8>,
    /// Server INTERNALDATE, the fallback when the message has no `Date`.
    pub internal_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedWindow {
    /// Message count reported by the server when the folder was selected.
    pub total: u32,
    pub messages: Vec<RawMessage>,
}

/// Sequence numbers of the most recent `limit` messages of a folder holding
/// `total` messages, or `None` when there is nothing to fetch.
pub fn fetch_window(total: u32, limit: u32) -> Option<RangeInclusive<u32>> {
    if total == 0 || limit == 0 {
        return None;
    }
    let start = if total > limit { total - limit + 1 } else { 1 };
    Some(start..=total)
}

#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub content_base64: String,
}

impl OutgoingAttachment {
    pub fn decoded_content(&self) -> Result<Vec<u8>, EmailError> {
        STANDARD
            .decode(self.content_base64.as_bytes())
            .map_err(|err| EmailError::Validation(format!("invalid attachment base64: {err}")))
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub message_id: String,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub attachments: Vec<OutgoingAttachment>,
}

/// Source of raw messages for a sync pass. The shipped implementation
/// re-fetches the newest window on every call; an incremental strategy can
/// be swapped in behind the same trait.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn fetch(
        &self,
        credentials: &ServerCredentials,
        folder_path: &str,
        limit: u32,
    ) -> Result<FetchedWindow, EmailError>;
}

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Submits `mail` and returns the Message-ID it was sent with.
    async fn submit(
        &self,
        credentials: &ServerCredentials,
        mail: &OutgoingMail,
    ) -> Result<String, EmailError>;
}

/// Builds a `<uuid@domain>` Message-ID using the sender's domain.
pub fn new_message_id(from: &MailAddress) -> String {
    let domain = from.domain().unwrap_or_else(|| "mycelix".to_string());
    format!("<{}@{domain}>", Uuid::new_v4())
}

/// Rejects mail that could never be submitted. Runs before any network I/O.
pub fn validate_outgoing(mail: &OutgoingMail) -> Result<(), EmailError> {
    if mail.to.is_empty() {
        return Err(EmailError::Validation(
            "at least one recipient is required".to_string(),
        ));
    }

    to_mailbox(&mail.from)?;
    for address in mail.to.iter().chain(&mail.cc).chain(&mail.bcc) {
        to_mailbox(address)?;
    }
    for attachment in &mail.attachments {
        attachment.decoded_content()?;
        attachment
            .mime_type
            .parse::<header::ContentType>()
            .map_err(|err| {
                EmailError::Validation(format!(
                    "invalid attachment mime type {}: {err}",
                    attachment.mime_type
                ))
            })?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImapSmtpBackend;

#[async_trait]
impl MailboxConnector for ImapSmtpBackend {
    async fn fetch(
        &self,
        credentials: &ServerCredentials,
        folder_path: &str,
        limit: u32,
    ) -> Result<FetchedWindow, EmailError> {
        let credentials = credentials.clone();
        let folder = folder_path.to_string();

        task::spawn_blocking(move || fetch_recent_imap(&credentials, &folder, limit))
            .await
            .map_err(|err| EmailError::Task(format!("imap fetch task failed: {err}")))?
    }
}

#[async_trait]
impl OutboundTransport for ImapSmtpBackend {
    async fn submit(
        &self,
        credentials: &ServerCredentials,
        outgoing: &OutgoingMail,
    ) -> Result<String, EmailError> {
        let message = build_message(outgoing)?;

        let relay = if credentials.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&credentials.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&credentials.host)
        };
        let builder = relay.map_err(|err| EmailError::Smtp(err.to_string()))?;

        let transport = builder
            .port(credentials.port)
            .credentials(Credentials::new(
                credentials.username.clone(),
                credentials.password.clone(),
            ))
            .build();

        transport
            .send(message)
            .await
            .map_err(|err| EmailError::Smtp(err.to_string()))?;

        tracing::info!(
            host = %credentials.host,
            recipients = outgoing.to.len() + outgoing.cc.len() + outgoing.bcc.len(),
            message_id = %outgoing.message_id,
            "submitted outgoing mail"
        );
        Ok(outgoing.message_id.clone())
    }
}

fn build_message(outgoing: &OutgoingMail) -> Result<Message, EmailError> {
    let mut builder = Message::builder()
        .message_id(Some(outgoing.message_id.clone()))
        .from(to_mailbox(&outgoing.from)?)
        .subject(outgoing.subject.clone());

    for to in &outgoing.to {
        builder = builder.to(to_mailbox(to)?);
    }
    for cc in &outgoing.cc {
        builder = builder.cc(to_mailbox(cc)?);
    }
    for bcc in &outgoing.bcc {
        builder = builder.bcc(to_mailbox(bcc)?);
    }

    let alternative = MultiPart::alternative()
        .singlepart(SinglePart::plain(outgoing.body_text.clone()))
        .singlepart(
            SinglePart::builder()
                .header(header::ContentType::TEXT_HTML)
                .body(outgoing.body_html.clone()),
        );

    let payload = if outgoing.attachments.is_empty() {
        alternative
    } else {
        let mut mixed = MultiPart::mixed().multipart(alternative);
        for attachment in &outgoing.attachments {
            let bytes = attachment.decoded_content()?;
            let mime = attachment.mime_type.parse().map_err(|err| {
                EmailError::Build(format!("invalid attachment mime type: {err}"))
            })?;
            mixed = mixed
                .singlepart(Attachment::new(attachment.file_name.clone()).body(bytes, mime));
        }
        mixed
    };

    builder
        .multipart(payload)
        .map_err(|err| EmailError::Build(err.to_string()))
}

fn fetch_recent_imap(
    credentials: &ServerCredentials,
    folder_path: &str,
    limit: u32,
) -> Result<FetchedWindow, EmailError> {
    let mut session = connect_imap_session(credentials)?;
    let result = fetch_window_from_session(&mut session, folder_path, limit);
    if let Err(err) = session.logout() {
        tracing::debug!(host = %credentials.host, "imap logout failed: {err}");
    }
    result
}

fn fetch_window_from_session(
    session: &mut imap::Session<imap::Connection>,
    folder_path: &str,
    limit: u32,
) -> Result<FetchedWindow, EmailError> {
    let mailbox = session
        .select(folder_path)
        .map_err(|err| EmailError::Connection(format!("cannot select {folder_path}: {err}")))?;
    let total = mailbox.exists;

    let Some(window) = fetch_window(total, limit) else {
        return Ok(FetchedWindow {
            total,
            messages: Vec::new(),
        });
    };

    let sequence = format!("{}:{}", window.start(), window.end());
    let fetches = session
        .fetch(&sequence, "(RFC822 INTERNALDATE)")
        .map_err(imap_error_to_email)?;

    let messages = fetches
        .iter()
        .filter_map(|fetched| {
            fetched.body().map(|body| RawMessage {
                sequence: fetched.message,
                bytes: body.to_vec(),
                internal_date: fetched
                    .internal_date()
                    .map(|datetime| datetime.with_timezone(&Utc)),
            })
        })
        .collect::<Vec<_>>();

    tracing::debug!(
        folder = folder_path,
        total,
        fetched = messages.len(),
        "fetched imap window"
    );
    Ok(FetchedWindow { total, messages })
}

fn connect_imap_session(
    credentials: &ServerCredentials,
) -> Result<imap::Session<imap::Connection>, EmailError> {
    let mode = if credentials.secure {
        imap::ConnectionMode::Tls
    } else {
        imap::ConnectionMode::Plaintext
    };

    let client = imap::ClientBuilder::new(credentials.host.as_str(), credentials.port)
        .mode(mode)
        .connect()
        .map_err(imap_error_to_email)?;

    client
        .login(credentials.username.clone(), credentials.password.clone())
        .map_err(|err| imap_error_to_email(err.0))
}

fn imap_error_to_email(error: imap::Error) -> EmailError {
    EmailError::Connection(format!("imap error: {error}"))
}

fn to_mailbox(address: &MailAddress) -> Result<Mailbox, EmailError> {
    let email = address.address.parse().map_err(|err| {
        EmailError::Validation(format!("invalid email {}: {err}", address.address))
    })?;

    Ok(Mailbox::new(address.name.clone(), email))
}
