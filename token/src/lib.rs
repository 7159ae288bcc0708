//! JWT-based bearer token verification.
//!
//! Every request to the file-transfer service carries a JWT bearer token.
//! The server validates its signature (RS256 or HS256, depending on
//! deployment) and, on success, trusts three claims:
//!
//! - `user`: the identity used for logging and the request hook.
//! - `groups`: group ids the caller belongs to.
//! - `roles`: role ids the caller holds, checked against each route's
//!   `roles_allowed` list.
//!
//! ## Opaqueness
//!
//! The token format is otherwise unstable. Claims beyond `user`/`groups`/
//! `roles` and the standard RFC 7519 ones should never be interpreted by
//! a client.
//!
//! ## Supplying the token
//!
//! The JWT can be supplied in one of two ways:
//!
//! - As a normal Bearer token.
//! - As the password in Basic Auth. The username is ignored.
//!
//! ## Example token
//!
//! ```json
//! {
//!   "sub": "alice",
//!   "exp": 4102324986,
//!   "user": "alice",
//!   "groups": ["p11", "p11-ci"],
//!   "roles": ["uploader", "downloader"]
//! }
//! ```

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables)
)]

pub mod util;

#[cfg(test)]
mod tests;

use std::error::Error as StdError;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use chrono::{DateTime, Utc};
use displaydoc::Display;
use jsonwebtoken::{Algorithm, Validation};
pub use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use serde::{Deserialize, Serialize};

/// A set of JWT claims.
///
/// Lifted from the shape of `jwt_simple::JWTClaims`, but with timestamps
/// as bare `i64` and a single string audience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JWTClaims<CustomClaims> {
    /// Time the claims were created at
    #[serde(rename = "iat", default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,

    /// Time the claims expire at
    #[serde(rename = "exp", default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    /// Time the claims will be invalid until
    #[serde(rename = "nbf", default, skip_serializing_if = "Option::is_none")]
    pub invalid_before: Option<i64>,

    /// Issuer
    #[serde(rename = "iss", default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    /// Subject
    #[serde(rename = "sub", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Audience
    #[serde(rename = "aud", default, skip_serializing_if = "Option::is_none")]
    pub audiences: Option<String>,

    /// JWT identifier
    #[serde(rename = "jti", default, skip_serializing_if = "Option::is_none")]
    pub jwt_id: Option<String>,

    /// Nonce
    #[serde(rename = "nonce", default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Custom (application-defined) claims, inlined at the top level.
    #[serde(flatten)]
    pub custom: CustomClaims,
}

/// A validated JSON Web Token.
#[derive(Debug)]
pub struct Token(JWTClaims<TokenClaims>);

/// Claims carried by every token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    /// Identity of the caller, used for logging and the request hook.
    user: String,

    /// Group ids the caller belongs to.
    #[serde(default)]
    groups: Vec<String>,

    /// Role ids the caller holds.
    #[serde(default)]
    roles: Vec<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A token error.
#[derive(Debug, Display)]
pub enum Error {
    /// Caller does not hold any of the roles required for this route.
    RoleDenied,

    /// JWT error: {0}
    TokenError(jsonwebtoken::errors::Error),

    /// Base64 decode error: {0}
    Base64Error(base64::DecodeError),

    /// RSA key error: {0}
    RsaKeyError(rsa::pkcs1::Error),

    /// Failure decoding the base64 layer of a base64-encoded key
    Utf8Error(std::str::Utf8Error),
}

impl Token {
    /// Verifies and decodes a token signed with RS256.
    pub fn from_jwt_rs256(token: &str, key: &DecodingKey) -> Result<Self> {
        Self::from_jwt(token, key, Algorithm::RS256)
    }

    /// Verifies and decodes a token signed with HS256.
    pub fn from_jwt_hs256(token: &str, key: &DecodingKey) -> Result<Self> {
        Self::from_jwt(token, key, Algorithm::HS256)
    }

    fn from_jwt(token: &str, key: &DecodingKey, algorithm: Algorithm) -> Result<Self> {
        let mut validation = Validation::new(algorithm);
        validation.validate_nbf = true;

        jsonwebtoken::decode::<JWTClaims<TokenClaims>>(token, key, &validation)
            .map_err(Error::TokenError)
            .map(|token_data| token_data.claims)
            .map(Token)
    }

    /// Creates a new token with an expiration timestamp.
    pub fn new(user: String, exp: &DateTime<Utc>) -> Self {
        let claims = TokenClaims {
            user: user.clone(),
            groups: Vec::new(),
            roles: Vec::new(),
        };

        Self(JWTClaims {
            issued_at: None,
            expires_at: Some(exp.timestamp()),
            invalid_before: None,
            issuer: None,
            subject: Some(user),
            audiences: None,
            jwt_id: None,
            nonce: None,
            custom: claims,
        })
    }

    /// Encodes the token with the given algorithm.
    pub fn encode(&self, key: &EncodingKey, algorithm: Algorithm) -> Result<String> {
        let mut header = jsonwebtoken::Header::default();
        header.alg = algorithm;
        jsonwebtoken::encode(&header, &self.0, key).map_err(Error::TokenError)
    }

    /// Returns the subject of the token.
    pub fn sub(&self) -> Option<&str> {
        self.0.subject.as_deref()
    }

    /// Returns the caller's identity, for logging and the request hook.
    pub fn user(&self) -> &str {
        &self.0.custom.user
    }

    /// Returns the groups the caller belongs to.
    pub fn groups(&self) -> &[String] {
        &self.0.custom.groups
    }

    /// Returns the roles the caller holds.
    pub fn roles(&self) -> &[String] {
        &self.0.custom.roles
    }

    /// Sets the groups granted to this token.
    pub fn set_groups(&mut self, groups: Vec<String>) {
        self.0.custom.groups = groups;
    }

    /// Sets the roles granted to this token.
    pub fn set_roles(&mut self, roles: Vec<String>) {
        self.0.custom.roles = roles;
    }

    /// Requires that at least one of `roles_allowed` is present in
    /// `claims.roles`.
    pub fn require_any_role(&self, roles_allowed: &[&str]) -> Result<()> {
        let roles = self.roles();
        if roles_allowed.iter().any(|r| roles.iter().any(|g| g == r)) {
            Ok(())
        } else {
            tracing::debug!(user = self.user(), "caller has none of the required roles");
            Err(Error::RoleDenied)
        }
    }

    /// Returns the claims as a serializable value.
    pub fn opaque_claims(&self) -> &impl Serialize {
        &self.0
    }
}

impl StdError for Error {}

/// Decodes a base64-encoded RS256 keypair, returning both halves.
///
/// Mirrors how a deployment that both mints and verifies tokens (rather
/// than only verifying tokens minted elsewhere) stores a single private
/// key in configuration.
pub fn decode_token_rs256_secret_base64(s: &str) -> Result<(EncodingKey, DecodingKey)> {
    let decoded = BASE64_STANDARD.decode(s).map_err(Error::Base64Error)?;
    let secret = std::str::from_utf8(&decoded).map_err(Error::Utf8Error)?;

    let private_key = rsa::RsaPrivateKey::from_pkcs1_pem(secret).map_err(Error::RsaKeyError)?;
    let public_key = private_key.to_public_key();
    let public_pkcs1_pem = public_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(Error::RsaKeyError)?;

    let encoding_key = EncodingKey::from_rsa_pem(secret.as_bytes()).map_err(Error::TokenError)?;
    let decoding_key =
        DecodingKey::from_rsa_pem(public_pkcs1_pem.as_bytes()).map_err(Error::TokenError)?;

    Ok((encoding_key, decoding_key))
}

/// Decodes a base64-encoded RS256 public key, for verify-only deployments.
pub fn decode_token_rs256_pubkey_base64(s: &str) -> Result<DecodingKey> {
    let decoded = BASE64_STANDARD.decode(s).map_err(Error::Base64Error)?;
    let pem = std::str::from_utf8(&decoded).map_err(Error::Utf8Error)?;

    DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(Error::TokenError)
}

/// Decodes a base64-encoded HS256 shared secret.
pub fn decode_token_hs256_secret_base64(s: &str) -> Result<(EncodingKey, DecodingKey)> {
    let decoded = BASE64_STANDARD.decode(s).map_err(Error::Base64Error)?;

    Ok((
        EncodingKey::from_secret(&decoded),
        DecodingKey::from_secret(&decoded),
    ))
}
