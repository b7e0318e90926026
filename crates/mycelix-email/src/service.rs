use crate::mime::{decode_batch, strip_html_tags};
use crate::{
    new_message_id, validate_outgoing, EmailError, ImapSmtpBackend, MailboxConnector,
    OutboundTransport, OutgoingAttachment, OutgoingMail, ReconcileOutcome, Reconciler,
    ServerCredentials,
};
use chrono::Utc;
use mycelix_core::{
    Account, FolderKind, MailAddress, MailAttachment, Message, Pagination, SearchResult,
};
use mycelix_realtime::{ConnectionRegistry, EmailSummary, RealtimeEvent};
use mycelix_security::SecretCipher;
use mycelix_storage::{FlagPolicy, Storage};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Size of the newest window fetched from each folder.
    pub fetch_limit: u32,
    pub flags: FlagPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            fetch_limit: 50,
            flags: FlagPolicy::Preserve,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub account_id: Uuid,
    pub folder_path: String,
    /// Message count the server reported for the folder.
    pub remote_total: u32,
    pub synced: usize,
    pub inserted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub account_id: Uuid,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_html: String,
    pub attachments: Vec<OutgoingAttachment>,
}

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: String,
    /// The copy filed into the Sent folder, if the account has one.
    pub sent_copy: Option<Message>,
}

#[derive(Clone)]
pub struct EmailService {
    storage: Storage,
    cipher: Arc<dyn SecretCipher>,
    connector: Arc<dyn MailboxConnector>,
    transport: Arc<dyn OutboundTransport>,
    realtime: ConnectionRegistry,
    reconciler: Reconciler,
    fetch_limit: u32,
}

impl EmailService {
    pub fn new(
        storage: Storage,
        cipher: Arc<dyn SecretCipher>,
        realtime: ConnectionRegistry,
        options: SyncOptions,
    ) -> Self {
        Self::with_backends(
            storage,
            cipher,
            realtime,
            options,
            Arc::new(ImapSmtpBackend),
            Arc::new(ImapSmtpBackend),
        )
    }

    pub fn with_backends(
        storage: Storage,
        cipher: Arc<dyn SecretCipher>,
        realtime: ConnectionRegistry,
        options: SyncOptions,
        connector: Arc<dyn MailboxConnector>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(storage.clone(), options.flags),
            storage,
            cipher,
            connector,
            transport,
            realtime,
            fetch_limit: options.fetch_limit,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn realtime(&self) -> &ConnectionRegistry {
        &self.realtime
    }

    pub async fn sync_folder(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        folder_path: &str,
    ) -> Result<SyncReport, EmailError> {
        let account = self.account(user_id, account_id).await?;
        self.sync_account_folder(&account, folder_path).await
    }

    /// Fetches the newest window of `folder_path`, reconciles it, and
    /// notifies the account owner of every new message.
    pub async fn sync_account_folder(
        &self,
        account: &Account,
        folder_path: &str,
    ) -> Result<SyncReport, EmailError> {
        let folder = self
            .storage
            .find_folder_by_path(account.id, folder_path)
            .await?
            .ok_or(EmailError::NotFound("folder"))?;
        let credentials = ServerCredentials::decrypt(&account.imap, self.cipher.as_ref())?;

        let window = self
            .connector
            .fetch(&credentials, &folder.path, self.fetch_limit)
            .await?;
        let decoded = decode_batch(&window.messages);
        let skipped = window.messages.len() - decoded.len();

        let ReconcileOutcome { synced, inserted } = self
            .reconciler
            .reconcile(account.id, &folder, decoded)
            .await?;
        self.storage.mark_account_synced(account.id, Utc::now()).await?;

        for message in &inserted {
            self.realtime.publish(
                account.user_id,
                &RealtimeEvent::NewEmail {
                    email: EmailSummary::from(message),
                },
            );
        }

        tracing::info!(
            account_id = %account.id,
            folder = folder_path,
            remote_total = window.total,
            synced,
            inserted = inserted.len(),
            skipped,
            "folder sync complete"
        );

        Ok(SyncReport {
            account_id: account.id,
            folder_path: folder.path,
            remote_total: window.total,
            synced,
            inserted: inserted.len(),
        })
    }

    /// Submits a message through the account's SMTP relay and files a copy
    /// into its Sent folder. Malformed requests are rejected before any
    /// network I/O.
    pub async fn send(
        &self,
        user_id: Uuid,
        request: SendRequest,
    ) -> Result<SentMessage, EmailError> {
        if request.to.iter().all(|address| address.trim().is_empty()) {
            return Err(EmailError::Validation(
                "at least one recipient is required".to_string(),
            ));
        }

        let account = self.account(user_id, request.account_id).await?;
        let from = MailAddress::new(account.email_address.clone());
        let body_text = strip_html_tags(&request.body_html);
        let outgoing = OutgoingMail {
            message_id: new_message_id(&from),
            from,
            to: addresses(&request.to),
            cc: addresses(&request.cc),
            bcc: addresses(&request.bcc),
            subject: request.subject,
            body_html: request.body_html,
            body_text,
            attachments: request.attachments,
        };
        validate_outgoing(&outgoing)?;

        let credentials = ServerCredentials::decrypt(&account.smtp, self.cipher.as_ref())?;
        let message_id = self.transport.submit(&credentials, &outgoing).await?;

        let sent_copy = match self
            .storage
            .find_folder_by_kind(account.id, FolderKind::Sent)
            .await?
        {
            Some(sent) => {
                let copy = sent_copy(&account, sent.id, &message_id, outgoing)?;
                Some(self.storage.upsert_message(&copy, FlagPolicy::Preserve).await?)
            }
            None => {
                tracing::debug!(account_id = %account.id, "no sent folder, skipping sent copy");
                None
            }
        };

        Ok(SentMessage {
            message_id,
            sent_copy,
        })
    }

    /// `search` narrows the page to messages whose subject or text body
    /// contains it, ignoring case.
    pub async fn list_messages(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        folder_id: Option<Uuid>,
        search: Option<&str>,
        pagination: Pagination,
    ) -> Result<SearchResult<Message>, EmailError> {
        let account = self.account(user_id, account_id).await?;
        if let Some(folder_id) = folder_id {
            let folder = self
                .storage
                .get_folder(folder_id)
                .await?
                .filter(|folder| folder.account_id == account.id);
            if folder.is_none() {
                return Err(EmailError::NotFound("folder"));
            }
        }

        Ok(self
            .storage
            .list_messages(
                account.id,
                folder_id,
                search,
                pagination.limit as i64,
                pagination.offset as i64,
            )
            .await?)
    }

    /// Returns the message and marks it read.
    pub async fn open_message(
        &self,
        user_id: Uuid,
        message_id: Uuid,
    ) -> Result<Message, EmailError> {
        let message = self.message(user_id, message_id).await?;
        if message.is_read {
            return Ok(message);
        }
        self.apply_read(user_id, message, true).await
    }

    pub async fn set_read(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        read: bool,
    ) -> Result<Message, EmailError> {
        let message = self.message(user_id, message_id).await?;
        self.apply_read(user_id, message, read).await
    }

    pub async fn set_starred(
        &self,
        user_id: Uuid,
        message_id: Uuid,
        starred: bool,
    ) -> Result<Message, EmailError> {
        let message = self.message(user_id, message_id).await?;
        self.storage.set_message_starred(message.id, starred).await?;
        Ok(Message {
            is_starred: starred,
            ..message
        })
    }

    pub async fn delete_message(&self, user_id: Uuid, message_id: Uuid) -> Result<(), EmailError> {
        let message = self.message(user_id, message_id).await?;
        self.storage.delete_message(message.id).await?;
        Ok(())
    }

    async fn apply_read(
        &self,
        user_id: Uuid,
        message: Message,
        read: bool,
    ) -> Result<Message, EmailError> {
        self.storage.set_message_read(message.id, read).await?;
        self.realtime.publish(
            user_id,
            &RealtimeEvent::EmailRead {
                email_id: message.id,
                is_read: read,
            },
        );
        Ok(Message {
            is_read: read,
            ..message
        })
    }

    async fn account(&self, user_id: Uuid, account_id: Uuid) -> Result<Account, EmailError> {
        self.storage
            .find_account(user_id, account_id)
            .await?
            .ok_or(EmailError::NotFound("account"))
    }

    async fn message(&self, user_id: Uuid, message_id: Uuid) -> Result<Message, EmailError> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or(EmailError::NotFound("message"))?;
        self.storage
            .find_account(user_id, message.account_id)
            .await?
            .ok_or(EmailError::NotFound("message"))?;
        Ok(message)
    }
}

fn addresses(raw: &[String]) -> Vec<MailAddress> {
    raw.iter()
        .map(|address| address.trim())
        .filter(|address| !address.is_empty())
        .map(MailAddress::new)
        .collect()
}

fn sent_copy(
    account: &Account,
    folder_id: Uuid,
    message_id: &str,
    outgoing: OutgoingMail,
) -> Result<Message, EmailError> {
    let attachments = outgoing
        .attachments
        .iter()
        .map(|attachment| {
            Ok(MailAttachment {
                filename: attachment.file_name.clone(),
                content_type: attachment.mime_type.clone(),
                size: attachment.decoded_content()?.len() as u64,
                content_id: None,
            })
        })
        .collect::<Result<Vec<_>, EmailError>>()?;

    let now = Utc::now();
    Ok(Message {
        id: Uuid::new_v4(),
        account_id: account.id,
        folder_id,
        message_id: message_id.to_string(),
        subject: outgoing.subject,
        from: outgoing.from,
        to: outgoing.to,
        cc: outgoing.cc,
        bcc: outgoing.bcc,
        reply_to: Vec::new(),
        size: outgoing.body_html.len() as u64,
        body_text: Some(outgoing.body_text),
        body_html: Some(outgoing.body_html),
        is_read: true,
        is_starred: false,
        attachments,
        sent_at: now,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::{EmailService, SendRequest, SyncOptions};
    use crate::accounts::tests::{cipher, new_account};
    use crate::{
        AccountService, EmailError, FetchedWindow, MailboxConnector, OutboundTransport,
        OutgoingMail, RawMessage, ServerCredentials,
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use mycelix_core::{Account, FolderKind, Pagination};
    use mycelix_realtime::ConnectionRegistry;
    use mycelix_storage::Storage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeConnector {
        messages: Vec<RawMessage>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MailboxConnector for FakeConnector {
        async fn fetch(
            &self,
            _credentials: &ServerCredentials,
            _folder_path: &str,
            limit: u32,
        ) -> Result<FetchedWindow, EmailError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let total = self.messages.len() as u32;
            let messages = match crate::fetch_window(total, limit) {
                Some(window) => self
                    .messages
                    .iter()
                    .filter(|raw| window.contains(&raw.sequence))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            };
            Ok(FetchedWindow { total, messages })
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        submitted: Mutex<Vec<(String, OutgoingMail)>>,
    }

    impl FakeTransport {
        fn submissions(&self) -> usize {
            self.submitted.lock().map(|sent| sent.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl OutboundTransport for FakeTransport {
        async fn submit(
            &self,
            credentials: &ServerCredentials,
            mail: &OutgoingMail,
        ) -> Result<String, EmailError> {
            self.submitted
                .lock()
                .expect("lock")
                .push((credentials.password.clone(), mail.clone()));
            Ok(mail.message_id.clone())
        }
    }

    fn raw(index: u32) -> RawMessage {
        RawMessage {
            sequence: index,
            bytes: format!(
                concat!(
                    "From: Friend {index} <friend{index}@example.com>\r\n",
                    "To: me@example.com\r\n",
                    "Subject: Hello {index}\r\n",
                    "Message-ID: <hello-{index}@example.com>\r\n",
                    "Date: Wed, 01 May 2024 09:00:00 +0000\r\n",
                    "\r\n",
                    "hi there\r\n"
                ),
                index = index
            )
            .into_bytes(),
            internal_date: None,
        }
    }

    struct Harness {
        service: EmailService,
        transport: Arc<FakeTransport>,
        connector: Arc<FakeConnector>,
        account: Account,
        storage: Storage,
    }

    async fn harness(messages: Vec<RawMessage>) -> Harness {
        let storage = Storage::connect_in_memory().await.expect("storage");
        let cipher = cipher();
        let accounts = AccountService::new(storage.clone(), Arc::clone(&cipher));
        let account = accounts
            .create_account(Uuid::new_v4(), new_account("me@example.com"))
            .await
            .expect("account");

        let connector = Arc::new(FakeConnector {
            messages,
            calls: AtomicUsize::new(0),
        });
        let transport = Arc::new(FakeTransport::default());
        let service = EmailService::with_backends(
            storage.clone(),
            cipher,
            ConnectionRegistry::new(),
            SyncOptions::default(),
            connector.clone(),
            transport.clone(),
        );

        Harness {
            service,
            transport,
            connector,
            account,
            storage,
        }
    }

    fn hello_request(account_id: Uuid) -> SendRequest {
        SendRequest {
            account_id,
            to: vec!["b@x.com".to_string()],
            subject: "Hi".to_string(),
            body_html: "<p>hey</p>".to_string(),
            ..SendRequest::default()
        }
    }

    #[tokio::test]
    async fn send_files_a_read_plain_text_copy_into_sent() {
        let h = harness(Vec::new()).await;
        let sent = h
            .service
            .send(h.account.user_id, hello_request(h.account.id))
            .await
            .expect("send");

        assert!(!sent.message_id.is_empty());
        assert_eq!(h.transport.submissions(), 1);
        let (password, mail) = h.transport.submitted.lock().expect("lock")[0].clone();
        assert_eq!(password, "app-password");
        assert_eq!(mail.to[0].address, "b@x.com");

        let sent_folder = h
            .storage
            .find_folder_by_kind(h.account.id, FolderKind::Sent)
            .await
            .expect("lookup")
            .expect("sent folder");
        let page = h
            .service
            .list_messages(
                h.account.user_id,
                h.account.id,
                Some(sent_folder.id),
                None,
                Pagination::default(),
            )
            .await
            .expect("list");
        assert_eq!(page.total, 1);
        let copy = &page.items[0];
        assert_eq!(copy.message_id, sent.message_id);
        assert_eq!(copy.body_text.as_deref(), Some("hey"));
        assert_eq!(copy.body_html.as_deref(), Some("<p>hey</p>"));
        assert!(copy.is_read);
        assert_eq!(copy.subject, "Hi");
    }

    #[tokio::test]
    async fn missing_sent_folder_is_not_an_error() {
        let h = harness(Vec::new()).await;
        let sent_folder = h
            .storage
            .find_folder_by_kind(h.account.id, FolderKind::Sent)
            .await
            .expect("lookup")
            .expect("sent folder");
        h.storage.delete_folder(sent_folder.id).await.expect("drop sent");

        let sent = h
            .service
            .send(h.account.user_id, hello_request(h.account.id))
            .await
            .expect("send");
        assert!(sent.sent_copy.is_none());
        assert_eq!(h.transport.submissions(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_relay() {
        let h = harness(Vec::new()).await;

        let mut empty = hello_request(h.account.id);
        empty.to = Vec::new();
        assert!(matches!(
            h.service.send(h.account.user_id, empty).await,
            Err(EmailError::Validation(_))
        ));

        let mut malformed = hello_request(h.account.id);
        malformed.to = vec!["definitely not an address".to_string()];
        assert!(matches!(
            h.service.send(h.account.user_id, malformed).await,
            Err(EmailError::Validation(_))
        ));

        assert!(matches!(
            h.service
                .send(Uuid::new_v4(), hello_request(h.account.id))
                .await,
            Err(EmailError::NotFound(_))
        ));
        assert_eq!(h.transport.submissions(), 0);
    }

    #[tokio::test]
    async fn sync_skips_malformed_messages_and_notifies_owner() {
        let mut messages: Vec<RawMessage> = (1..=9).map(raw).collect();
        messages.push(RawMessage {
            sequence: 10,
            bytes: b"\r\n\r\nnot a mail".to_vec(),
            internal_date: None,
        });
        let h = harness(messages).await;
        let mut subscription = h.service.realtime().register(h.account.user_id);
        let _welcome = subscription.try_recv();

        let report = h
            .service
            .sync_folder(h.account.user_id, h.account.id, "INBOX")
            .await
            .expect("sync");
        assert_eq!(report.remote_total, 10);
        assert_eq!(report.synced, 9);
        assert_eq!(report.inserted, 9);

        let mut notified = 0;
        while let Some(payload) = subscription.try_recv() {
            assert!(payload.contains("\"new_email\""));
            notified += 1;
        }
        assert_eq!(notified, 9);

        let inbox = h
            .storage
            .find_folder_by_path(h.account.id, "INBOX")
            .await
            .expect("lookup")
            .expect("inbox");
        assert_eq!(inbox.total_count, 9);
        assert_eq!(inbox.unread_count, 9);

        let again = h
            .service
            .sync_folder(h.account.user_id, h.account.id, "INBOX")
            .await
            .expect("resync");
        assert_eq!(again.inserted, 0);
        assert!(subscription.try_recv().is_none());
        assert_eq!(h.storage.count_messages(h.account.id).await.expect("count"), 9);
    }

    #[tokio::test]
    async fn html_only_undated_mail_is_searchable_and_stable() {
        let received = Utc.with_ymd_and_hms(2024, 6, 3, 7, 15, 0).unwrap();
        let newsletter = RawMessage {
            sequence: 1,
            bytes: concat!(
                "From: news@example.com\r\n",
                "To: me@example.com\r\n",
                "Subject: Weekly digest\r\n",
                "Message-ID: <digest@example.com>\r\n",
                "Content-Type: text/html\r\n",
                "\r\n",
                "<p>This is URGENT please review</p>\r\n",
            )
            .as_bytes()
            .to_vec(),
            internal_date: Some(received),
        };
        let h = harness(vec![newsletter, raw(2)]).await;
        h.service
            .sync_folder(h.account.user_id, h.account.id, "INBOX")
            .await
            .expect("sync");

        let found = h
            .service
            .list_messages(
                h.account.user_id,
                h.account.id,
                None,
                Some("Urgent"),
                Pagination::default(),
            )
            .await
            .expect("search");
        assert_eq!(found.total, 1);
        let digest = found.items[0].clone();
        assert_eq!(digest.sent_at, received);

        h.service
            .sync_folder(h.account.user_id, h.account.id, "INBOX")
            .await
            .expect("resync");
        let again = h
            .service
            .message(h.account.user_id, digest.id)
            .await
            .expect("reload");
        assert_eq!(again.sent_at, received);
        assert_eq!(again.updated_at, digest.updated_at);
    }

    #[tokio::test]
    async fn sync_requires_a_known_folder_and_owner() {
        let h = harness(vec![raw(1)]).await;
        assert!(matches!(
            h.service
                .sync_folder(h.account.user_id, h.account.id, "INBOX/Nope")
                .await,
            Err(EmailError::NotFound("folder"))
        ));
        assert!(matches!(
            h.service
                .sync_folder(Uuid::new_v4(), h.account.id, "INBOX")
                .await,
            Err(EmailError::NotFound("account"))
        ));
        assert_eq!(h.connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn opening_marks_read_and_publishes() {
        let h = harness(vec![raw(1)]).await;
        h.service
            .sync_folder(h.account.user_id, h.account.id, "INBOX")
            .await
            .expect("sync");
        let listed = h
            .service
            .list_messages(
                h.account.user_id,
                h.account.id,
                None,
                None,
                Pagination::default(),
            )
            .await
            .expect("list");
        let message_id = listed.items[0].id;

        let mut subscription = h.service.realtime().register(h.account.user_id);
        let _welcome = subscription.try_recv();

        let opened = h
            .service
            .open_message(h.account.user_id, message_id)
            .await
            .expect("open");
        assert!(opened.is_read);
        let event = subscription.try_recv().expect("email_read event");
        assert!(event.contains("\"email_read\""));
        assert!(event.contains(&message_id.to_string()));

        assert!(matches!(
            h.service.open_message(Uuid::new_v4(), message_id).await,
            Err(EmailError::NotFound("message"))
        ));

        let starred = h
            .service
            .set_starred(h.account.user_id, message_id, true)
            .await
            .expect("star");
        assert!(starred.is_starred);

        h.service
            .delete_message(h.account.user_id, message_id)
            .await
            .expect("delete");
        assert!(matches!(
            h.service.set_read(h.account.user_id, message_id, false).await,
            Err(EmailError::NotFound("message"))
        ));
    }
}
