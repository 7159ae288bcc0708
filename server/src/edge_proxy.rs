//! EdgeProxy: the outward-facing upload handler (spec §4.6).
//!
//! Validates auth/pnum/filename/group, then relays the request body to the
//! internal `upload_stream` endpoint (served by [`crate::stream_pipeline`]
//! through the same router, on loopback) via a real HTTP hop. A bounded
//! single-slot channel carries body chunks from the client connection to the
//! outbound request, giving the same backpressure as the teacher's
//! `tornado.queues.Queue(1)`-fed `body_producer`.
//!
//! Grounded on `original_source/tsdfileapi/api.py`'s `ProxyHandler`.

use std::time::Duration;

use async_stream::stream;
use axum::http::{Method, StatusCode};
use bytes::Bytes;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::mpsc;

use filegate_core::filename::Filename;
use filegate_core::tenant::Pnum;

use crate::error::{ServerError, ServerResult};

lazy_static! {
    static ref GROUP_REGEX: Regex = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
}

/// Internal requests get a very long ceiling to accommodate slow, large
/// uploads; see spec §4.6 "Timeout".
const INTERNAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60 + 20 * 60);

/// The channel's buffer is 1: a sender suspends until the body producer has
/// consumed the previous chunk.
const CHANNEL_CAPACITY: usize = 1;

/// Validates the `group` query parameter against the tenant and the
/// caller's claimed groups, returning the effective group name.
///
/// `claims_groups` being empty models a token carrying no `groups` claim
/// (e.g. Basic Auth): only the tenant's default member group is then
/// permitted, matching the teacher's fallback.
pub fn validate_group(pnum: &Pnum, requested: Option<&str>, claims_groups: &[String]) -> ServerResult<String> {
    let default_group = format!("{}-member-group", pnum.as_str());
    let group = requested.map(str::to_owned).unwrap_or_else(|| default_group.clone());

    if !GROUP_REGEX.is_match(&group) {
        return Err(ServerError::PolicyRejected(format!("invalid group name: {group}")));
    }

    let prefix = format!("{}-", pnum.as_str());
    if !group.starts_with(&prefix) {
        return Err(ServerError::PolicyRejected(
            "group name does not belong to this tenant".to_owned(),
        ));
    }

    let permitted = if claims_groups.is_empty() {
        group == default_group
    } else {
        claims_groups.iter().any(|g| g == &group)
    };

    if !permitted {
        return Err(ServerError::AuthRejected);
    }

    Ok(group)
}

/// Resolves the upload filename: from the URI path segment if present,
/// otherwise the legacy `Filename` header, otherwise a timestamped default.
pub fn resolve_filename(uri_filename: Option<&str>, header_filename: Option<&str>, now_iso: &str) -> ServerResult<Filename> {
    let raw = uri_filename
        .or(header_filename)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{now_iso}.txt"));

    Filename::new(raw).map_err(|_| ServerError::FilenameInvalid)
}

/// Headers carried from the client request to the internal request.
/// `Authorization`, `Filename` and `Content-Type` are always forwarded;
/// the rest only if present, matching the teacher's conditional headers.
#[derive(Debug, Clone)]
pub struct ForwardedHeaders {
    pub authorization: String,
    pub filename: String,
    pub content_type: String,
    pub aes_key: Option<String>,
    pub aes_iv: Option<String>,
    pub pragma: Option<String>,
}

/// Everything needed to build and issue the internal request.
pub struct ProxyRequest {
    pub method: Method,
    pub internal_port: u16,
    pub pnum: Pnum,
    pub backend: String,
    pub filename: Filename,
    pub group: String,
    pub chunk: Option<String>,
    pub id: Option<String>,
    pub headers: ForwardedHeaders,
}

impl ProxyRequest {
    fn internal_url(&self) -> String {
        let mut url = format!(
            "http://localhost:{port}/v1/{pnum}/{backend}/upload_stream/{filename}?group={group}",
            port = self.internal_port,
            pnum = self.pnum,
            backend = self.backend,
            filename = urlencoding_escape(self.filename.as_str()),
            group = self.group,
        );
        if let Some(chunk) = &self.chunk {
            url.push_str("&chunk=");
            url.push_str(chunk);
        }
        if let Some(id) = &self.id {
            url.push_str("&id=");
            url.push_str(id);
        }
        url
    }
}

fn urlencoding_escape(s: &str) -> String {
    // Filenames are already restricted to an alphanumeric+`._-` whitelist
    // (filegate_core::filename::Filename), so no byte needs escaping.
    s.to_owned()
}

/// The client-facing end of the body relay: chunks pushed here are
/// forwarded to the internal request, suspending until the previous chunk
/// has been sent (spec §4.6 steps 5-7).
pub struct BodyRelay {
    sender: mpsc::Sender<Bytes>,
}

impl BodyRelay {
    pub async fn push(&self, chunk: Bytes) -> ServerResult<()> {
        self.sender
            .send(chunk)
            .await
            .map_err(|_| ServerError::InternalServerError)
    }
}

/// Issues the internal request, returning a [`BodyRelay`] to feed it and a
/// future that resolves to the rewritten `(status, body)` once the internal
/// response completes.
pub fn begin(
    client: reqwest::Client,
    req: ProxyRequest,
) -> (BodyRelay, tokio::task::JoinHandle<ServerResult<(StatusCode, Bytes)>>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let url = req.internal_url();
    let headers = req.headers.clone();
    let method = req.method.clone();

    let task = tokio::spawn(async move {
        let mut builder = client
            .request(method.clone(), &url)
            .timeout(INTERNAL_REQUEST_TIMEOUT)
            .header("Authorization", &headers.authorization)
            .header("Filename", &headers.filename)
            .header("Content-Type", &headers.content_type);

        if let Some(v) = &headers.aes_key {
            builder = builder.header("Aes-Key", v);
        }
        if let Some(v) = &headers.aes_iv {
            builder = builder.header("Aes-Iv", v);
        }
        if let Some(v) = &headers.pragma {
            builder = builder.header("Pragma", v);
        }

        if method != Method::HEAD {
            let body_stream = stream! {
                let mut rx = rx;
                while let Some(chunk) = rx.recv().await {
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
            };
            builder = builder.body(reqwest::Body::wrap_stream(body_stream));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServerError::request_error(RequestFailed(e.to_string())))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ServerError::request_error(RequestFailed(e.to_string())))?;

        Ok((rewrite_status(status, &body), body))
    });

    (BodyRelay { sender: tx }, task)
}

/// Rewrites the internal response's status to 400 if its body is the JSON
/// `{"message":"chunk_order_incorrect"}`, matching spec §4.6 step 8. Kept
/// independent of the inner handler's own status so the proxy tier never
/// has to trust it.
fn rewrite_status(status: StatusCode, body: &[u8]) -> StatusCode {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(json) if json.get("message").and_then(|m| m.as_str()) == Some("chunk_order_incorrect") => {
            StatusCode::BAD_REQUEST
        }
        _ => status,
    }
}

#[derive(Debug)]
struct RequestFailed(String);

impl std::fmt::Display for RequestFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "internal proxied request failed: {}", self.0)
    }
}

impl std::error::Error for RequestFailed {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_group_default() {
        let pnum = Pnum::new("p11").unwrap();
        let group = validate_group(&pnum, None, &[]).unwrap();
        assert_eq!(group, "p11-member-group");
    }

    #[test]
    fn test_validate_group_rejects_wrong_tenant() {
        let pnum = Pnum::new("p11").unwrap();
        let err = validate_group(&pnum, Some("p12-member-group"), &["p12-member-group".to_owned()]).unwrap_err();
        assert!(matches!(err, ServerError::PolicyRejected(_)));
    }

    #[test]
    fn test_validate_group_requires_membership() {
        let pnum = Pnum::new("p11").unwrap();
        let err = validate_group(&pnum, Some("p11-other-group"), &["p11-member-group".to_owned()]).unwrap_err();
        assert!(matches!(err, ServerError::AuthRejected));
    }

    #[test]
    fn test_validate_group_basic_auth_fallback() {
        let pnum = Pnum::new("p11").unwrap();
        let group = validate_group(&pnum, None, &[]).unwrap();
        assert_eq!(group, "p11-member-group");
        validate_group(&pnum, Some("p11-other-group"), &[]).unwrap_err();
    }

    #[test]
    fn test_rewrite_status_on_chunk_order_incorrect() {
        let body = br#"{"message":"chunk_order_incorrect"}"#;
        assert_eq!(rewrite_status(StatusCode::OK, body), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_rewrite_status_passthrough() {
        let body = br#"{"message":"ok"}"#;
        assert_eq!(rewrite_status(StatusCode::CREATED, body), StatusCode::CREATED);
    }

    #[test]
    fn test_resolve_filename_prefers_uri() {
        let f = resolve_filename(Some("a.bin"), Some("b.bin"), "2024-01-01T00:00:00").unwrap();
        assert_eq!(f.as_str(), "a.bin");
    }

    #[test]
    fn test_resolve_filename_defaults_to_timestamp() {
        let f = resolve_filename(None, None, "2024-01-01T00-00-00").unwrap();
        assert_eq!(f.as_str(), "2024-01-01T00-00-00.txt");
    }
}
