use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub version: u32,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    /// Size of the most-recent window fetched per folder on every pass.
    pub fetch_limit: u32,
    pub folders: Vec<String>,
    /// When set, a re-sync resets read/starred flags of known messages.
    #[serde(default)]
    pub overwrite_flags_on_resync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConfig {
    pub keychain_service: String,
    /// Environment variable consulted for the master key before the keychain.
    pub master_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: 1,
            database: DatabaseConfig {
                file_name: "mycelix.sqlite3".to_string(),
            },
            sync: SyncConfig {
                poll_interval_secs: 120,
                fetch_limit: 50,
                folders: vec!["INBOX".to_string()],
                overwrite_flags_on_resync: false,
            },
            security: SecurityConfig {
                keychain_service: "io.mycelix.mail".to_string(),
                master_key_env: "MYCELIX_ENCRYPTION_KEY".to_string(),
            },
            logging: LoggingConfig::default(),
        }
    }
}
