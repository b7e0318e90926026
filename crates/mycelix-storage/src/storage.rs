use crate::StorageError;
use chrono::{DateTime, Utc};
use mycelix_core::{Account, Folder, FolderKind, Message, SearchResult, ServerSettings};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// How an upsert treats the read/starred flags of a message that already
/// exists in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagPolicy {
    /// Keep whatever the user last set.
    #[default]
    Preserve,
    /// Reset flags to the incoming values on every re-sync.
    Overwrite,
}

const MESSAGE_INSERT: &str = r#"
    INSERT INTO messages (
      id, account_id, folder_id, message_id, subject,
      from_json, to_json, cc_json, bcc_json, reply_to_json,
      body_text, body_html, size, is_read, is_starred,
      attachments_json, sent_at, created_at, updated_at
    ) VALUES (
      ?1, ?2, ?3, ?4, ?5,
      ?6, ?7, ?8, ?9, ?10,
      ?11, ?12, ?13, ?14, ?15,
      ?16, ?17, ?18, ?19
    )
"#;

const CONTENT_UNCHANGED: &str = r#"
      messages.subject IS excluded.subject
      AND messages.from_json IS excluded.from_json
      AND messages.to_json IS excluded.to_json
      AND messages.cc_json IS excluded.cc_json
      AND messages.bcc_json IS excluded.bcc_json
      AND messages.reply_to_json IS excluded.reply_to_json
      AND messages.body_text IS excluded.body_text
      AND messages.body_html IS excluded.body_html
      AND messages.size IS excluded.size
      AND messages.attachments_json IS excluded.attachments_json
      AND messages.sent_at IS excluded.sent_at
"#;

const LIST_FILTER: &str = r#"account_id = ?1
      AND (?2 IS NULL OR folder_id = ?2)
      AND (?3 IS NULL
        OR instr(lower(subject), ?3) > 0
        OR instr(lower(COALESCE(body_text, '')), ?3) > 0)"#;

/// `updated_at` only moves when the stored row actually changes, so that
/// re-syncing an unchanged window leaves every row untouched.
fn upsert_message_sql(flags: FlagPolicy) -> String {
    let (flag_columns, flags_unchanged) = match flags {
        FlagPolicy::Preserve => ("", ""),
        FlagPolicy::Overwrite => (
            "is_read = excluded.is_read,\n      is_starred = excluded.is_starred,",
            "AND messages.is_read IS excluded.is_read \
             AND messages.is_starred IS excluded.is_starred",
        ),
    };

    format!(
        r#"{MESSAGE_INSERT}
    ON CONFLICT(account_id, message_id) DO UPDATE SET
      subject = excluded.subject,
      from_json = excluded.from_json,
      to_json = excluded.to_json,
      cc_json = excluded.cc_json,
      bcc_json = excluded.bcc_json,
      reply_to_json = excluded.reply_to_json,
      body_text = excluded.body_text,
      body_html = excluded.body_html,
      size = excluded.size,
      {flag_columns}
      attachments_json = excluded.attachments_json,
      sent_at = excluded.sent_at,
      updated_at = CASE
        WHEN {CONTENT_UNCHANGED} {flags_unchanged}
        THEN messages.updated_at
        ELSE excluded.updated_at
      END
    RETURNING *
"#
    )
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(16)
            .connect_with(options)
            .await?;

        tracing::debug!(path = %db_path.display(), "opened mail database");
        Self::from_pool(pool).await
    }

    /// A private in-memory database. The pool holds a single connection that
    /// is never recycled, since each SQLite memory connection is its own
    /// database.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- accounts ------------------------------------------------------------

    pub async fn insert_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (
              id, user_id, email_address, provider,
              imap_host, imap_port, imap_secure, imap_username, imap_password,
              smtp_host, smtp_port, smtp_secure, smtp_username, smtp_password,
              is_default, last_synced_at, created_at, updated_at
            ) VALUES (
              ?1, ?2, ?3, ?4,
              ?5, ?6, ?7, ?8, ?9,
              ?10, ?11, ?12, ?13, ?14,
              ?15, ?16, ?17, ?18
            )
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.user_id.to_string())
        .bind(&account.email_address)
        .bind(&account.provider)
        .bind(&account.imap.host)
        .bind(account.imap.port as i64)
        .bind(account.imap.secure as i64)
        .bind(&account.imap.username)
        .bind(&account.imap.password_encrypted)
        .bind(&account.smtp.host)
        .bind(account.smtp.port as i64)
        .bind(account.smtp.secure as i64)
        .bind(&account.smtp.username)
        .bind(&account.smtp.password_encrypted)
        .bind(account.is_default as i64)
        .bind(account.last_synced_at.map(|value| value.to_rfc3339()))
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Looks up an account only if it belongs to `user_id`.
    pub async fn find_account(
        &self,
        user_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?1 AND user_id = ?2")
            .bind(account_id.to_string())
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_account).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query("SELECT * FROM accounts ORDER BY email_address")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    pub async fn list_user_accounts(&self, user_id: Uuid) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM accounts
            WHERE user_id = ?1
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_account).collect()
    }

    pub async fn count_user_accounts(&self, user_id: Uuid) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM accounts WHERE user_id = ?1")
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(count.max(0) as u64)
    }

    pub async fn clear_default_accounts(&self, user_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE accounts SET is_default = 0, updated_at = ?1 WHERE user_id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrites the editable columns of an existing account.
    pub async fn update_account(&self, account: &Account) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE accounts SET
              email_address = ?1, provider = ?2,
              imap_host = ?3, imap_port = ?4, imap_secure = ?5,
              imap_username = ?6, imap_password = ?7,
              smtp_host = ?8, smtp_port = ?9, smtp_secure = ?10,
              smtp_username = ?11, smtp_password = ?12,
              updated_at = ?13
            WHERE id = ?14
            "#,
        )
        .bind(&account.email_address)
        .bind(&account.provider)
        .bind(&account.imap.host)
        .bind(account.imap.port as i64)
        .bind(account.imap.secure as i64)
        .bind(&account.imap.username)
        .bind(&account.imap.password_encrypted)
        .bind(&account.smtp.host)
        .bind(account.smtp.port as i64)
        .bind(account.smtp.secure as i64)
        .bind(&account.smtp.username)
        .bind(&account.smtp.password_encrypted)
        .bind(account.updated_at.to_rfc3339())
        .bind(account.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_account_default(
        &self,
        account_id: Uuid,
        is_default: bool,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE accounts SET is_default = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(is_default as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(account_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_account_synced(
        &self,
        account_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE accounts SET last_synced_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(at.to_rfc3339())
            .bind(account_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_account(&self, account_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- folders -------------------------------------------------------------

    pub async fn insert_folder(&self, folder: &Folder) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO folders (id, account_id, name, path, kind, unread_count, total_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(folder.id.to_string())
        .bind(folder.account_id.to_string())
        .bind(&folder.name)
        .bind(&folder.path)
        .bind(folder.kind.as_str())
        .bind(folder.unread_count as i64)
        .bind(folder.total_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_folder(&self, folder_id: Uuid) -> Result<Option<Folder>, StorageError> {
        let row = sqlx::query("SELECT * FROM folders WHERE id = ?1")
            .bind(folder_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_folder).transpose()
    }

    pub async fn find_folder_by_path(
        &self,
        account_id: Uuid,
        path: &str,
    ) -> Result<Option<Folder>, StorageError> {
        let row = sqlx::query("SELECT * FROM folders WHERE account_id = ?1 AND path = ?2")
            .bind(account_id.to_string())
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_folder).transpose()
    }

    pub async fn find_folder_by_kind(
        &self,
        account_id: Uuid,
        kind: FolderKind,
    ) -> Result<Option<Folder>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM folders
            WHERE account_id = ?1 AND kind = ?2
            ORDER BY path ASC
            LIMIT 1
            "#,
        )
        .bind(account_id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_folder).transpose()
    }

    pub async fn list_folders(&self, account_id: Uuid) -> Result<Vec<Folder>, StorageError> {
        let rows = sqlx::query("SELECT * FROM folders WHERE account_id = ?1 ORDER BY name ASC")
            .bind(account_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_folder).collect()
    }

    pub async fn rename_folder(&self, folder_id: Uuid, name: &str) -> Result<(), StorageError> {
        sqlx::query("UPDATE folders SET name = ?1 WHERE id = ?2")
            .bind(name)
            .bind(folder_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_folder(&self, folder_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM folders WHERE id = ?1")
            .bind(folder_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_folder_counts(
        &self,
        folder_id: Uuid,
        unread_count: u32,
        total_count: u32,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE folders SET unread_count = ?1, total_count = ?2 WHERE id = ?3")
            .bind(unread_count as i64)
            .bind(total_count as i64)
            .bind(folder_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- messages ------------------------------------------------------------

    /// Inserts `message`, or refreshes the stored row carrying the same
    /// `(account_id, message_id)`. The row id and folder of an existing
    /// message never change. Returns the row as stored.
    pub async fn upsert_message(
        &self,
        message: &Message,
        flags: FlagPolicy,
    ) -> Result<Message, StorageError> {
        let sql = upsert_message_sql(flags);
        let row = sqlx::query(&sql)
            .bind(message.id.to_string())
            .bind(message.account_id.to_string())
            .bind(message.folder_id.to_string())
            .bind(&message.message_id)
            .bind(&message.subject)
            .bind(serde_json::to_string(&message.from)?)
            .bind(serde_json::to_string(&message.to)?)
            .bind(serde_json::to_string(&message.cc)?)
            .bind(serde_json::to_string(&message.bcc)?)
            .bind(serde_json::to_string(&message.reply_to)?)
            .bind(&message.body_text)
            .bind(&message.body_html)
            .bind(message.size as i64)
            .bind(message.is_read as i64)
            .bind(message.is_starred as i64)
            .bind(serde_json::to_string(&message.attachments)?)
            .bind(message.sent_at.to_rfc3339())
            .bind(message.created_at.to_rfc3339())
            .bind(message.updated_at.to_rfc3339())
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_message(row)
    }

    pub async fn get_message(&self, message_id: Uuid) -> Result<Option<Message>, StorageError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_message).transpose()
    }

    pub async fn count_messages(&self, account_id: Uuid) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE account_id = ?1")
            .bind(account_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(count.max(0) as u64)
    }

    /// Newest first. `total` is the full match count, not the page size.
    /// `search` matches subject or text body, ignoring case.
    pub async fn list_messages(
        &self,
        account_id: Uuid,
        folder_id: Option<Uuid>,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<SearchResult<Message>, StorageError> {
        let folder = folder_id.map(|id| id.to_string());
        let needle = search
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase);

        let count_row = sqlx::query(&format!(
            "SELECT COUNT(*) AS cnt FROM messages WHERE {LIST_FILTER}"
        ))
        .bind(account_id.to_string())
        .bind(folder.as_deref())
        .bind(needle.as_deref())
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = count_row.try_get("cnt")?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM messages WHERE {LIST_FILTER} \
             ORDER BY sent_at DESC LIMIT ?4 OFFSET ?5"
        ))
        .bind(account_id.to_string())
        .bind(folder.as_deref())
        .bind(needle.as_deref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let items: Vec<Message> = rows
            .into_iter()
            .map(Self::row_to_message)
            .collect::<Result<_, _>>()?;

        Ok(SearchResult {
            total: total.max(0) as usize,
            items,
        })
    }

    pub async fn set_message_read(&self, message_id: Uuid, read: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE messages SET is_read = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(read as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_message_starred(
        &self,
        message_id: Uuid,
        starred: bool,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE messages SET is_starred = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(starred as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_account(row: SqliteRow) -> Result<Account, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let user_raw: String = row.try_get("user_id")?;
        let synced_raw: Option<String> = row.try_get("last_synced_at")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(Account {
            id: parse_uuid(&id_raw, "accounts.id")?,
            user_id: parse_uuid(&user_raw, "accounts.user_id")?,
            email_address: row.try_get("email_address")?,
            provider: row.try_get("provider")?,
            imap: ServerSettings {
                host: row.try_get("imap_host")?,
                port: parse_port(row.try_get("imap_port")?, "accounts.imap_port")?,
                secure: row.try_get::<i64, _>("imap_secure")? == 1,
                username: row.try_get("imap_username")?,
                password_encrypted: row.try_get("imap_password")?,
            },
            smtp: ServerSettings {
                host: row.try_get("smtp_host")?,
                port: parse_port(row.try_get("smtp_port")?, "accounts.smtp_port")?,
                secure: row.try_get::<i64, _>("smtp_secure")? == 1,
                username: row.try_get("smtp_username")?,
                password_encrypted: row.try_get("smtp_password")?,
            },
            is_default: row.try_get::<i64, _>("is_default")? == 1,
            last_synced_at: synced_raw
                .as_deref()
                .map(|raw| parse_datetime(raw, "accounts.last_synced_at"))
                .transpose()?,
            created_at: parse_datetime(&created_raw, "accounts.created_at")?,
            updated_at: parse_datetime(&updated_raw, "accounts.updated_at")?,
        })
    }

    fn row_to_folder(row: SqliteRow) -> Result<Folder, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let account_raw: String = row.try_get("account_id")?;
        let kind_raw: String = row.try_get("kind")?;

        Ok(Folder {
            id: parse_uuid(&id_raw, "folders.id")?,
            account_id: parse_uuid(&account_raw, "folders.account_id")?,
            name: row.try_get("name")?,
            path: row.try_get("path")?,
            kind: FolderKind::from_str(&kind_raw)
                .map_err(|err| StorageError::Data(format!("folders.kind: {err}")))?,
            unread_count: row.try_get::<i64, _>("unread_count")?.max(0) as u32,
            total_count: row.try_get::<i64, _>("total_count")?.max(0) as u32,
        })
    }

    fn row_to_message(row: SqliteRow) -> Result<Message, StorageError> {
        let id_raw: String = row.try_get("id")?;
        let account_raw: String = row.try_get("account_id")?;
        let folder_raw: String = row.try_get("folder_id")?;
        let sent_raw: String = row.try_get("sent_at")?;
        let created_raw: String = row.try_get("created_at")?;
        let updated_raw: String = row.try_get("updated_at")?;

        Ok(Message {
            id: parse_uuid(&id_raw, "messages.id")?,
            account_id: parse_uuid(&account_raw, "messages.account_id")?,
            folder_id: parse_uuid(&folder_raw, "messages.folder_id")?,
            message_id: row.try_get("message_id")?,
            subject: row.try_get("subject")?,
            from: parse_json(
                &row.try_get::<String, _>("from_json")?,
                "messages.from_json",
            )?,
            to: parse_json(&row.try_get::<String, _>("to_json")?, "messages.to_json")?,
            cc: parse_json(&row.try_get::<String, _>("cc_json")?, "messages.cc_json")?,
            bcc: parse_json(&row.try_get::<String, _>("bcc_json")?, "messages.bcc_json")?,
            reply_to: parse_json(
                &row.try_get::<String, _>("reply_to_json")?,
                "messages.reply_to_json",
            )?,
            body_text: row.try_get("body_text")?,
            body_html: row.try_get("body_html")?,
            size: row.try_get::<i64, _>("size")?.max(0) as u64,
            is_read: row.try_get::<i64, _>("is_read")? == 1,
            is_starred: row.try_get::<i64, _>("is_starred")? == 1,
            attachments: parse_json(
                &row.try_get::<String, _>("attachments_json")?,
                "messages.attachments_json",
            )?,
            sent_at: parse_datetime(&sent_raw, "messages.sent_at")?,
            created_at: parse_datetime(&created_raw, "messages.created_at")?,
            updated_at: parse_datetime(&updated_raw, "messages.updated_at")?,
        })
    }
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid uuid for {field}: {err}")))
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

fn parse_port(raw: i64, field: &str) -> Result<u16, StorageError> {
    u16::try_from(raw).map_err(|_| StorageError::Data(format!("invalid port for {field}: {raw}")))
}

fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw)
        .map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}
