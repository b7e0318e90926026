mod cipher;
mod error;
mod keychain;

pub use cipher::{AesGcmCipher, SecretCipher};
pub use error::SecurityError;
pub use keychain::{SecretKey, SecretStore};
