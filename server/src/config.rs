//! Server configuration.

use std::collections::HashMap;
use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use derivative::Derivative;
use serde::{de, Deserialize};
use xdg::BaseDirectories;

use filegate_token::{DecodingKey, EncodingKey};

use crate::export_policy::ExportPolicyConfig;
use crate::path_resolver::BackendConfig;
use crate::tenant_keys::TenantKeysConfig;

/// Application prefix in XDG base directories.
const XDG_PREFIX: &str = "filegate";

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// Useful for deploying to platforms that only pass configuration through
/// environment variables (e.g. Fly.io).
const ENV_CONFIG_BASE64: &str = "FILEGATE_CONFIG_BASE64";

/// Environment variable storing the base64-encoded HMAC secret used to
/// sign and verify JWTs, when no per-tenant key store is configured.
const ENV_TOKEN_HS256_SECRET_BASE64: &str = "FILEGATE_TOKEN_HS256_SECRET_BASE64";

/// Environment variable storing the base64-encoded RSA PEM PKCS1 private
/// key used to sign and verify JWTs.
const ENV_TOKEN_RS256_SECRET_BASE64: &str = "FILEGATE_TOKEN_RS256_SECRET_BASE64";

/// Environment variable storing the base64-encoded RSA PEM PKCS1 public
/// key used to verify (but not sign) JWTs.
const ENV_TOKEN_RS256_PUBKEY_BASE64: &str = "FILEGATE_TOKEN_RS256_PUBKEY_BASE64";

/// The service's configuration.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Allowed `Host` headers.
    ///
    /// This _must_ be configured for production use. If unconfigured or the
    /// list is empty, all `Host` headers are allowed.
    #[serde(rename = "allowed-hosts")]
    #[serde(default = "Vec::new")]
    pub allowed_hosts: Vec<String>,

    /// The canonical API endpoint of this server, used to build links in
    /// listing responses.
    #[serde(rename = "api-endpoint")]
    pub api_endpoint: Option<String>,

    /// The largest request body accepted before the connection is dropped.
    #[serde(rename = "max-body-size")]
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// The port the internal `upload_stream` endpoint is reachable on, on
    /// loopback (spec §4.6).
    #[serde(default = "default_internal_port")]
    pub port: u16,

    /// Identity passed to the request hook as its third argument.
    #[serde(rename = "api-user")]
    #[serde(default = "default_api_user")]
    pub api_user: String,

    /// Per-tenant JWT verification key resolution.
    #[serde(default = "Default::default")]
    pub jwt: JWTConfig,

    /// Per-tenant JWT verification keys (spec §9 "Global configuration").
    #[serde(rename = "tenant-keys")]
    pub tenant_keys: TenantKeysConfig,

    /// Named storage backends (`cluster`, `files`, ...), each resolving to
    /// an import and an export directory template.
    pub backends: Backends,

    /// Per-tenant/default export eligibility rules (spec §4.8).
    #[serde(rename = "export-policy")]
    pub export_policy: ExportPolicyConfig,

    /// The chunk size used when streaming file downloads.
    #[serde(rename = "export-chunk-size")]
    #[serde(default = "default_export_chunk_size")]
    pub export_chunk_size: usize,

    /// The maximum number of entries a directory listing may return before
    /// it fails with "too many files".
    #[serde(rename = "export-max-num-list")]
    #[serde(default = "default_export_max_num_list")]
    pub export_max_num_list: usize,

    /// An optional global ceiling on single-file exports, independent of
    /// any per-tenant `export-policy.max-size`.
    #[serde(rename = "export-max-size")]
    pub export_max_size: Option<u64>,

    /// The PGP private key used to unwrap PGP-encrypted `Aes-Key` headers,
    /// if this deployment supports PGP-wrapped AES keys at all.
    pub pgp: Option<PgpConfig>,
}

/// Named backend directory templates, keyed by backend name (`cluster`,
/// `files`, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct Backends(pub HashMap<String, BackendConfig>);

impl Backends {
    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.0.get(name)
    }
}

/// The service's OpenPGP private key material, for decrypting `Aes-Key`
/// headers that were encrypted to its public key.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
pub struct PgpConfig {
    /// Path to the ASCII-armored private key.
    #[serde(rename = "private-key-path")]
    pub private_key_path: PathBuf,

    /// The passphrase protecting the private key, if any.
    #[serde(default)]
    #[derivative(Debug = "ignore")]
    pub passphrase: String,
}

/// JSON Web Token verification configuration.
#[derive(Clone, Derivative, Deserialize)]
#[derivative(Debug)]
pub struct JWTConfig {
    /// The `iss` claim received JWTs must carry, if configured.
    #[serde(rename = "token-bound-issuer")]
    #[serde(default)]
    pub token_bound_issuer: Option<String>,

    /// The `aud` claim received JWTs must carry one of, if configured.
    #[serde(rename = "token-bound-audiences")]
    #[serde(default)]
    pub token_bound_audiences: Option<HashSet<String>>,
}

impl Default for JWTConfig {
    fn default() -> Self {
        Self {
            token_bound_issuer: None,
            token_bound_audiences: None,
        }
    }
}

/// Resolves a single shared JWT signing/verification key from, in order:
/// an explicit TOML value, or one of the three environment variables
/// (RS256 pubkey, RS256 secret, HS256 secret, tried in that order).
///
/// Used only when `tenant_keys.use_secret_store` is false and
/// `tenant_keys.secret` is unset — i.e. a single-tenant or
/// shared-secret deployment that still wants environment-based
/// provisioning (e.g. Fly.io secrets), mirroring the teacher's
/// environment-variable JWT bootstrapping.
pub fn load_shared_key_from_env() -> Option<(Option<EncodingKey>, DecodingKey)> {
    if let Some(s) = read_non_empty_var(ENV_TOKEN_RS256_PUBKEY_BASE64) {
        let key = filegate_token::decode_token_rs256_pubkey_base64(&s)
            .expect("FILEGATE_TOKEN_RS256_PUBKEY_BASE64 cannot be decoded");
        return Some((None, key));
    }
    if let Some(s) = read_non_empty_var(ENV_TOKEN_RS256_SECRET_BASE64) {
        let (enc, dec) = filegate_token::decode_token_rs256_secret_base64(&s)
            .expect("FILEGATE_TOKEN_RS256_SECRET_BASE64 cannot be decoded");
        return Some((Some(enc), dec));
    }
    if let Some(s) = read_non_empty_var(ENV_TOKEN_HS256_SECRET_BASE64) {
        let (enc, dec) = filegate_token::decode_token_hs256_secret_base64(&s)
            .expect("FILEGATE_TOKEN_HS256_SECRET_BASE64 cannot be decoded");
        return Some((Some(enc), dec));
    }
    None
}

fn read_non_empty_var(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

fn default_listen_address() -> SocketAddr {
    "[::]:8080".parse().unwrap()
}

fn default_max_body_size() -> usize {
    // 10 GiB: large enough for a single direct (non-resumable) upload.
    10 * 1024 * 1024 * 1024
}

fn default_internal_port() -> u16 {
    8080
}

fn default_api_user() -> String {
    "api".to_owned()
}

fn default_export_chunk_size() -> usize {
    64 * 1024
}

fn default_export_max_num_list() -> usize {
    5000
}

fn load_config_from_path(path: &Path) -> Result<Config> {
    tracing::info!("Using configuration: {:?}", path);

    let config = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&config)?)
}

fn load_config_from_str(s: &str) -> Result<Config> {
    tracing::info!("Using configuration from environment variable");
    Ok(toml::from_str(s)?)
}

/// Loads the configuration in the standard order of precedence:
/// 1. The path given on the command line.
/// 2. The base64-encoded TOML in `FILEGATE_CONFIG_BASE64`.
/// 3. The XDG config path (`$XDG_CONFIG_HOME/filegate/server.toml`).
pub async fn load_config(config_path: Option<&Path>) -> Option<Config> {
    if let Some(config_path) = config_path {
        return match load_config_from_path(config_path) {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("Error reading configuration: {e}");
                None
            }
        };
    }

    if let Ok(config_env) = env::var(ENV_CONFIG_BASE64) {
        let decoded = BASE64_STANDARD
            .decode(config_env.as_bytes())
            .expect("FILEGATE_CONFIG_BASE64 is not valid base64");
        let decoded = String::from_utf8(decoded).expect("FILEGATE_CONFIG_BASE64 is not valid UTF-8");
        return Some(load_config_from_str(&decoded).expect("FILEGATE_CONFIG_BASE64 is not valid TOML"));
    }

    match get_xdg_config_path() {
        Ok(config_path) if config_path.exists() => load_config_from_path(&config_path).ok(),
        _ => None,
    }
}

pub fn get_xdg_config_path() -> Result<PathBuf> {
    let xdg_dirs = BaseDirectories::with_prefix(XDG_PREFIX)?;
    let config_path = xdg_dirs.place_config_file("server.toml")?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [tenant-keys]
            secret = "c2VjcmV0"

            [backends.cluster]
            import-path = "/data/pXX/import"
            export-path = "/data/pXX/export"

            [export-policy.default]
            enabled = false
            allowed-mime-types = ["*"]
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_user, "api");
        assert!(config.backends.get("cluster").is_some());
    }
}
