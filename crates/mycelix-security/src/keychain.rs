use crate::SecurityError;
use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// OS keychain access, namespaced under one service name.
#[derive(Debug, Clone)]
pub struct SecretStore {
    service_name: String,
}

#[derive(Debug, Clone)]
pub struct SecretKey {
    pub namespace: String,
    pub id: String,
}

impl SecretKey {
    pub fn master_key() -> Self {
        Self {
            namespace: "encryption".to_string(),
            id: "master_key".to_string(),
        }
    }

    pub fn as_username(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

impl SecretStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn set(&self, key: &SecretKey, value: &str) -> Result<(), SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        entry.set_password(value)?;
        Ok(())
    }

    pub fn get(&self, key: &SecretKey) -> Result<Option<String>, SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the stored master key, generating and persisting a random one
    /// on first use.
    pub fn master_key(&self) -> Result<String, SecurityError> {
        let key = SecretKey::master_key();
        if let Some(existing) = self.get(&key)? {
            return Ok(existing);
        }

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let generated = STANDARD.encode(bytes);
        self.set(&key, &generated)?;
        tracing::info!(service = %self.service_name, "generated new master encryption key");
        Ok(generated)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}
