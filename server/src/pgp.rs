//! Unwraps the `Aes-Key` upload header.
//!
//! Clients encrypt their AES key (or passphrase) to the service's PGP public
//! key and send it base64-encoded in the `Aes-Key` header. This module holds
//! the service's private key in memory and decrypts that header on demand,
//! matching `original_source/tsdfileapi/api.py`'s `decrypt_aes_key`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use pgp::composed::{Deserializable, Message, SignedSecretKey};
use pgp::types::SecretKeyTrait;

use crate::error::{ServerError, ServerResult};

/// The service's unlocked OpenPGP private key, used to decrypt inbound
/// `Aes-Key` headers.
pub struct PgpKeyring {
    private_key: SignedSecretKey,
    passphrase: String,
}

impl PgpKeyring {
    pub fn from_armored(armored: &str, passphrase: String) -> ServerResult<Self> {
        let (private_key, _) = SignedSecretKey::from_string(armored)
            .map_err(|e| ServerError::request_error(anyhow::anyhow!("malformed PGP private key: {e}")))?;
        private_key
            .verify()
            .map_err(|e| ServerError::request_error(anyhow::anyhow!("PGP private key failed self-check: {e}")))?;

        Ok(Self {
            private_key,
            passphrase,
        })
    }

    /// Decrypts a base64-encoded, PGP-encrypted `Aes-Key` header value,
    /// returning its plaintext bytes (either a raw 32-byte key or a
    /// passphrase, depending on whether `Aes-Iv` was also supplied).
    pub fn unwrap_aes_key(&self, header_value: &str) -> ServerResult<Vec<u8>> {
        let ciphertext = BASE64
            .decode(header_value.trim())
            .map_err(|_| ServerError::PolicyRejected("Aes-Key is not valid base64".to_owned()))?;

        let (message, _) = Message::from_bytes(&ciphertext[..])
            .map_err(|e| ServerError::PolicyRejected(format!("Aes-Key is not a PGP message: {e}")))?;

        let (mut decrypted, _) = message
            .decrypt(|| self.passphrase.clone(), &[&self.private_key])
            .map_err(|e| ServerError::PolicyRejected(format!("failed to decrypt Aes-Key: {e}")))?;

        let content = decrypted
            .as_data_vec()
            .map_err(|e| ServerError::PolicyRejected(format!("empty Aes-Key payload: {e}")))?;

        Ok(content)
    }
}
