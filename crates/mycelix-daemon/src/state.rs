use anyhow::Context;
use mycelix_config::{AppConfig, ConfigManager};
use mycelix_email::{EmailService, SyncOptions};
use mycelix_realtime::ConnectionRegistry;
use mycelix_security::{AesGcmCipher, SecretCipher, SecretStore};
use mycelix_storage::{FlagPolicy, Storage};
use std::sync::Arc;

pub struct AppState {
    pub(crate) config: AppConfig,
    pub(crate) storage: Storage,
    pub(crate) email: EmailService,
}

impl AppState {
    pub async fn initialize(
        config_manager: &ConfigManager,
        config: AppConfig,
    ) -> anyhow::Result<Self> {
        let env_key = std::env::var(&config.security.master_key_env).ok();
        let secrets = SecretStore::new(config.security.keychain_service.clone());
        let master_key = resolve_master_key(env_key, &secrets)?;
        let cipher: Arc<dyn SecretCipher> = Arc::new(
            AesGcmCipher::from_master_key(&master_key).context("derive secret cipher")?,
        );

        let db_path = config_manager.data_dir().join(&config.database.file_name);
        let storage = Storage::connect(&db_path)
            .await
            .context("initialize sqlite storage")?;

        Ok(Self::assemble(config, storage, cipher))
    }

    pub(crate) fn assemble(
        config: AppConfig,
        storage: Storage,
        cipher: Arc<dyn SecretCipher>,
    ) -> Self {
        let email = EmailService::new(
            storage.clone(),
            cipher,
            ConnectionRegistry::new(),
            sync_options(&config),
        );

        Self {
            config,
            storage,
            email,
        }
    }

    /// Runs one sync of every configured folder for every account. Returns
    /// `(succeeded, failed)`; a failing folder never stops the pass.
    pub async fn sync_all(&self) -> anyhow::Result<(usize, usize)> {
        let accounts = self
            .storage
            .list_accounts()
            .await
            .context("list accounts for sync")?;
        let mut succeeded = 0_usize;
        let mut failed = 0_usize;

        for account in &accounts {
            for folder in &self.config.sync.folders {
                match self.email.sync_account_folder(account, folder).await {
                    Ok(_) => succeeded += 1,
                    Err(err) => {
                        failed += 1;
                        tracing::warn!(
                            account_id = %account.id,
                            folder = %folder,
                            "folder sync failed: {err}"
                        );
                    }
                }
            }
        }

        Ok((succeeded, failed))
    }
}

/// A key in the environment wins over the keychain; an empty variable is
/// treated as unset.
fn resolve_master_key(env_key: Option<String>, secrets: &SecretStore) -> anyhow::Result<String> {
    match env_key.filter(|key| !key.trim().is_empty()) {
        Some(key) => Ok(key),
        None => secrets
            .master_key()
            .with_context(|| format!("load master key from keychain {}", secrets.service_name())),
    }
}

fn sync_options(config: &AppConfig) -> SyncOptions {
    SyncOptions {
        fetch_limit: config.sync.fetch_limit,
        flags: if config.sync.overwrite_flags_on_resync {
            FlagPolicy::Overwrite
        } else {
            FlagPolicy::Preserve
        },
    }
}
