//! Per-tenant JWT verification keys.
//!
//! Secrets (per-tenant keys, PGP private material) are loaded into a
//! read-only in-memory store once at startup and looked up by tenant id on
//! each request (spec §9, "Global configuration"). Two deployment shapes
//! are supported, selected by `[tenant_keys]` in the TOML configuration:
//!
//! - A single static secret shared by every tenant (`secret = "..."`).
//! - A per-tenant secret store: a directory of files named `<pnum>.key`,
//!   loaded lazily and cached (`use_secret_store = true`, `secret_store =
//!   "/path/to/keys"`).

use std::path::PathBuf;

use dashmap::DashMap;
use filegate_token::{DecodingKey, Error as TokenError};
use jsonwebtoken::Algorithm;
use serde::Deserialize;

use filegate_core::tenant::Pnum;

/// Configuration for resolving a tenant's JWT verification key.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenantKeysConfig {
    /// Whether to resolve keys from `secret_store`, one file per tenant.
    #[serde(rename = "use-secret-store")]
    #[serde(default)]
    pub use_secret_store: bool,

    /// Directory holding `<pnum>.key` files (base64-encoded, PEM for RS256).
    #[serde(rename = "secret-store")]
    pub secret_store: Option<PathBuf>,

    /// A single secret shared by every tenant, used when `use_secret_store`
    /// is false.
    pub secret: Option<String>,

    /// The signing algorithm the secret(s) above are for.
    #[serde(default = "default_algorithm")]
    pub algorithm: KeyAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum KeyAlgorithm {
    #[serde(rename = "rs256")]
    RS256,
    #[serde(rename = "hs256")]
    HS256,
}

fn default_algorithm() -> KeyAlgorithm {
    KeyAlgorithm::RS256
}

impl KeyAlgorithm {
    fn jsonwebtoken(self) -> Algorithm {
        match self {
            Self::RS256 => Algorithm::RS256,
            Self::HS256 => Algorithm::HS256,
        }
    }
}

/// A read-only, lazily-populated store of per-tenant decoding keys.
#[derive(Debug)]
pub struct TenantKeyStore {
    config: TenantKeysConfig,
    cache: DashMap<String, DecodingKey>,
    static_key: Option<DecodingKey>,
}

#[derive(Debug, displaydoc::Display)]
pub enum KeyStoreError {
    /// No signing key is configured for tenant "{0}".
    NoKeyForTenant(String),
    /// Failed to read the secret store file for tenant "{0}": {1}
    SecretStoreIo(String, std::io::Error),
    /// Failed to decode the key for tenant "{0}": {1}
    Malformed(String, TokenError),
}

impl TenantKeyStore {
    pub fn new(config: TenantKeysConfig) -> Self {
        let static_key = config.secret.as_deref().map(|s| {
            decode_secret(s, config.algorithm).expect("static tenant_keys.secret is malformed")
        });

        Self {
            config,
            cache: DashMap::new(),
            static_key,
        }
    }

    /// Returns the algorithm tenant keys are expected to verify with.
    pub fn algorithm(&self) -> Algorithm {
        self.config.algorithm.jsonwebtoken()
    }

    /// Resolves the verification key for a tenant, loading it from the
    /// secret store on first use if configured.
    pub fn get(&self, pnum: &Pnum) -> Result<DecodingKey, KeyStoreError> {
        if !self.config.use_secret_store {
            return self
                .static_key
                .clone()
                .ok_or_else(|| KeyStoreError::NoKeyForTenant(pnum.to_string()));
        }

        if let Some(key) = self.cache.get(pnum.as_str()) {
            return Ok(key.clone());
        }

        let dir = self
            .config
            .secret_store
            .as_ref()
            .ok_or_else(|| KeyStoreError::NoKeyForTenant(pnum.to_string()))?;
        let path = dir.join(format!("{}.key", pnum.as_str()));

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| KeyStoreError::SecretStoreIo(pnum.to_string(), e))?;
        let key = decode_secret(contents.trim(), self.config.algorithm)
            .map_err(|e| KeyStoreError::Malformed(pnum.to_string(), e))?;

        self.cache.insert(pnum.as_str().to_owned(), key.clone());
        Ok(key)
    }
}

fn decode_secret(s: &str, algorithm: KeyAlgorithm) -> Result<DecodingKey, TokenError> {
    match algorithm {
        KeyAlgorithm::RS256 => filegate_token::decode_token_rs256_pubkey_base64(s),
        KeyAlgorithm::HS256 => {
            filegate_token::decode_token_hs256_secret_base64(s).map(|(_, dec)| dec)
        }
    }
}
