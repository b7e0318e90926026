use crate::EmailError;
use chrono::Utc;
use mycelix_core::{Account, Folder, FolderKind, ServerSettings};
use mycelix_security::SecretCipher;
use mycelix_storage::Storage;
use std::sync::Arc;
use uuid::Uuid;

/// Folders provisioned for every new account, as `(name, path, kind)`.
const DEFAULT_FOLDERS: [(&str, &str, FolderKind); 5] = [
    ("Inbox", "INBOX", FolderKind::Inbox),
    ("Sent", "INBOX/Sent", FolderKind::Sent),
    ("Drafts", "INBOX/Drafts", FolderKind::Drafts),
    ("Trash", "INBOX/Trash", FolderKind::Trash),
    ("Spam", "INBOX/Spam", FolderKind::Spam),
];

/// Server settings as entered by the user, password in plaintext.
#[derive(Clone)]
pub struct NewServerSettings {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for NewServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewServerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email_address: String,
    pub provider: String,
    pub imap: NewServerSettings,
    pub smtp: NewServerSettings,
}

/// Partial change to one protocol side. `None` keeps the stored value; a new
/// password is encrypted before it is stored.
#[derive(Clone, Default)]
pub struct ServerUpdate {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secure: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for ServerUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerUpdate")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub email_address: Option<String>,
    pub provider: Option<String>,
    pub imap: Option<ServerUpdate>,
    pub smtp: Option<ServerUpdate>,
}

#[derive(Clone)]
pub struct AccountService {
    storage: Storage,
    cipher: Arc<dyn SecretCipher>,
}

impl AccountService {
    pub fn new(storage: Storage, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { storage, cipher }
    }

    /// Stores a new account with encrypted passwords and its default
    /// folders. A user's first account becomes their default.
    pub async fn create_account(
        &self,
        user_id: Uuid,
        request: NewAccount,
    ) -> Result<Account, EmailError> {
        if !request.email_address.contains('@') {
            return Err(EmailError::Validation(format!(
                "invalid email address {}",
                request.email_address
            )));
        }
        for (side, settings) in [("imap", &request.imap), ("smtp", &request.smtp)] {
            if settings.host.trim().is_empty() {
                return Err(EmailError::Validation(format!("{side} host is required")));
            }
            if settings.port == 0 {
                return Err(EmailError::Validation(format!("{side} port is required")));
            }
        }

        let existing = self.storage.count_user_accounts(user_id).await?;
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            user_id,
            email_address: request.email_address,
            provider: request.provider,
            imap: self.seal(&request.imap)?,
            smtp: self.seal(&request.smtp)?,
            is_default: existing == 0,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_account(&account).await?;

        for (name, path, kind) in DEFAULT_FOLDERS {
            self.storage
                .insert_folder(&Folder {
                    id: Uuid::new_v4(),
                    account_id: account.id,
                    name: name.to_string(),
                    path: path.to_string(),
                    kind,
                    unread_count: 0,
                    total_count: 0,
                })
                .await?;
        }

        tracing::info!(
            account_id = %account.id,
            %user_id,
            is_default = account.is_default,
            "created mail account"
        );
        Ok(account)
    }

    pub async fn list_accounts(&self, user_id: Uuid) -> Result<Vec<Account>, EmailError> {
        Ok(self.storage.list_user_accounts(user_id).await?)
    }

    pub async fn account(&self, user_id: Uuid, account_id: Uuid) -> Result<Account, EmailError> {
        self.storage
            .find_account(user_id, account_id)
            .await?
            .ok_or(EmailError::NotFound("account"))
    }

    /// Clears the default flag on every account of the user, then sets it on
    /// `account_id`. Two statements, not atomic.
    pub async fn set_default_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> Result<Account, EmailError> {
        let account = self.account(user_id, account_id).await?;
        self.storage.clear_default_accounts(user_id).await?;
        self.storage.set_account_default(account.id, true).await?;
        Ok(Account {
            is_default: true,
            ..account
        })
    }

    /// Applies the fields present in `update` and keeps the rest.
    pub async fn update_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        update: AccountUpdate,
    ) -> Result<Account, EmailError> {
        let mut account = self.account(user_id, account_id).await?;

        if let Some(email_address) = update.email_address {
            if !email_address.contains('@') {
                return Err(EmailError::Validation(format!(
                    "invalid email address {email_address}"
                )));
            }
            account.email_address = email_address;
        }
        if let Some(provider) = update.provider {
            account.provider = provider;
        }
        if let Some(changes) = update.imap {
            self.apply_server_update("imap", &mut account.imap, changes)?;
        }
        if let Some(changes) = update.smtp {
            self.apply_server_update("smtp", &mut account.smtp, changes)?;
        }

        account.updated_at = Utc::now();
        self.storage.update_account(&account).await?;
        tracing::info!(account_id = %account.id, %user_id, "updated mail account");
        Ok(account)
    }

    pub async fn delete_account(&self, user_id: Uuid, account_id: Uuid) -> Result<(), EmailError> {
        let account = self.account(user_id, account_id).await?;
        self.storage.delete_account(account.id).await?;
        tracing::info!(account_id = %account.id, %user_id, "deleted mail account");
        Ok(())
    }

    pub async fn list_folders(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> Result<Vec<Folder>, EmailError> {
        let account = self.account(user_id, account_id).await?;
        Ok(self.storage.list_folders(account.id).await?)
    }

    pub async fn create_folder(
        &self,
        user_id: Uuid,
        account_id: Uuid,
        name: &str,
        path: &str,
    ) -> Result<Folder, EmailError> {
        let account = self.account(user_id, account_id).await?;
        if name.trim().is_empty() || path.trim().is_empty() {
            return Err(EmailError::Validation(
                "folder name and path are required".to_string(),
            ));
        }
        if self
            .storage
            .find_folder_by_path(account.id, path)
            .await?
            .is_some()
        {
            return Err(EmailError::Validation(format!(
                "folder {path} already exists"
            )));
        }

        let folder = Folder {
            id: Uuid::new_v4(),
            account_id: account.id,
            name: name.trim().to_string(),
            path: path.to_string(),
            kind: FolderKind::Custom,
            unread_count: 0,
            total_count: 0,
        };
        self.storage.insert_folder(&folder).await?;
        Ok(folder)
    }

    pub async fn rename_folder(
        &self,
        user_id: Uuid,
        folder_id: Uuid,
        name: &str,
    ) -> Result<Folder, EmailError> {
        if name.trim().is_empty() {
            return Err(EmailError::Validation("folder name is required".to_string()));
        }
        let folder = self.folder(user_id, folder_id).await?;
        self.storage.rename_folder(folder.id, name.trim()).await?;
        Ok(Folder {
            name: name.trim().to_string(),
            ..folder
        })
    }

    /// Deletes a custom folder together with its messages.
    pub async fn delete_folder(&self, user_id: Uuid, folder_id: Uuid) -> Result<(), EmailError> {
        let folder = self.folder(user_id, folder_id).await?;
        if folder.kind.is_system() {
            return Err(EmailError::ProtectedFolder(folder.path));
        }
        self.storage.delete_folder(folder.id).await?;
        Ok(())
    }

    /// Resolves a folder only if its account belongs to `user_id`.
    pub async fn folder(&self, user_id: Uuid, folder_id: Uuid) -> Result<Folder, EmailError> {
        let folder = self
            .storage
            .get_folder(folder_id)
            .await?
            .ok_or(EmailError::NotFound("folder"))?;
        self.storage
            .find_account(user_id, folder.account_id)
            .await?
            .ok_or(EmailError::NotFound("folder"))?;
        Ok(folder)
    }

    fn apply_server_update(
        &self,
        side: &str,
        settings: &mut ServerSettings,
        changes: ServerUpdate,
    ) -> Result<(), EmailError> {
        if let Some(host) = changes.host {
            if host.trim().is_empty() {
                return Err(EmailError::Validation(format!("{side} host is required")));
            }
            settings.host = host.trim().to_string();
        }
        if let Some(port) = changes.port {
            if port == 0 {
                return Err(EmailError::Validation(format!("{side} port is required")));
            }
            settings.port = port;
        }
        if let Some(secure) = changes.secure {
            settings.secure = secure;
        }
        if let Some(username) = changes.username {
            settings.username = username;
        }
        if let Some(password) = changes.password {
            settings.password_encrypted = self.cipher.encrypt(&password)?;
        }
        Ok(())
    }

    fn seal(&self, settings: &NewServerSettings) -> Result<ServerSettings, EmailError> {
        Ok(ServerSettings {
            host: settings.host.trim().to_string(),
            port: settings.port,
            secure: settings.secure,
            username: settings.username.clone(),
            password_encrypted: self.cipher.encrypt(&settings.password)?,
        })
    }
}
