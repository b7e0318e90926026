use crate::{AppConfig, ConfigError};
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

const ORG: &str = "io";
const AUTHOR: &str = "Mycelix";
const APP: &str = "MycelixMail";

#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: PathBuf,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from(ORG, AUTHOR, APP).ok_or(ConfigError::MissingDirectories)?;
        Self::with_dirs(
            dirs.config_dir().to_path_buf(),
            dirs.data_dir().to_path_buf(),
            dirs.cache_dir().to_path_buf(),
        )
    }

    /// Uses explicit directories instead of the platform defaults.
    pub fn with_dirs(
        config_dir: PathBuf,
        data_dir: PathBuf,
        cache_dir: PathBuf,
    ) -> Result<Self, ConfigError> {
        fs::create_dir_all(&config_dir)?;
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&cache_dir)?;

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            let initial = AppConfig::default();
            let content = toml::to_string_pretty(&initial)?;
            fs::write(&config_path, content)?;
            tracing::info!(path = %config_path.display(), "wrote default config");
        }

        Ok(Self {
            config_path,
            data_dir,
            cache_dir,
        })
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let content = fs::read_to_string(&self.config_path)?;
        let config: AppConfig = toml::from_str(&content)?;
        validate(&config)?;
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    if config.sync.fetch_limit == 0 {
        return Err(ConfigError::Invalid(
            "sync.fetch_limit must be at least 1".to_string(),
        ));
    }
    if config.sync.poll_interval_secs == 0 {
        return Err(ConfigError::Invalid(
            "sync.poll_interval_secs must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ConfigManager;
    use crate::{AppConfig, ConfigError};
    use std::path::PathBuf;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("mycelix-config-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn writes_and_reloads_default_config() {
        let root = scratch_dir();
        let manager =
            ConfigManager::with_dirs(root.join("config"), root.join("data"), root.join("cache"))
                .expect("manager");

        assert!(manager.config_path().exists());
        assert_eq!(manager.load().expect("load"), AppConfig::default());

        let mut config = AppConfig::default();
        config.sync.fetch_limit = 10;
        config.sync.overwrite_flags_on_resync = true;
        manager.save(&config).expect("save");
        assert_eq!(manager.load().expect("reload"), config);

        config.sync.fetch_limit = 0;
        manager.save(&config).expect("save");
        assert!(matches!(manager.load(), Err(ConfigError::Invalid(_))));

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn logging_section_is_optional() {
        let raw = r#"
            version = 1

            [database]
            file_name = "mail.db"

            [sync]
            poll_interval_secs = 30
            fetch_limit = 25
            folders = ["INBOX", "INBOX/Sent"]

            [security]
            keychain_service = "svc"
            master_key_env = "KEY"
        "#;

        let config: AppConfig = toml::from_str(raw).expect("parse");
        assert_eq!(config.logging.filter, "info");
        assert!(!config.sync.overwrite_flags_on_resync);
        assert_eq!(config.sync.folders.len(), 2);
    }
}
