mod accounts;
mod backend;
mod error;
pub mod mime;
mod reconcile;
mod service;

pub use accounts::{
    AccountService, AccountUpdate, NewAccount, NewServerSettings, ServerUpdate,
};
pub use backend::{
    fetch_window, new_message_id, validate_outgoing, FetchedWindow, ImapSmtpBackend,
    MailboxConnector, OutboundTransport, OutgoingAttachment, OutgoingMail, RawMessage,
    ServerCredentials,
};
pub use error::EmailError;
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use service::{EmailService, SendRequest, SentMessage, SyncOptions, SyncReport};
