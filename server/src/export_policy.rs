//! ExportPolicy: per-tenant rules governing which files may be downloaded
//! (spec §4.8).
//!
//! Grounded on `original_source/tsdfileapi/api.py`'s `enforce_export_policy`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use filegate_core::filename::Filename;
use filegate_core::mime;
use filegate_core::tenant::Pnum;

use crate::error::{ServerError, ServerResult};

/// `[export-policy.<pnum>|default]` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub enabled: bool,

    #[serde(rename = "allowed-mime-types")]
    pub allowed_mime_types: Vec<String>,

    #[serde(rename = "max-size")]
    pub max_size: Option<u64>,
}

/// The full `[export-policy]` table: a per-tenant override map plus a
/// `default` fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportPolicyConfig {
    #[serde(flatten)]
    pub per_tenant: HashMap<String, PolicyConfig>,
}

impl ExportPolicyConfig {
    fn policy_for(&self, pnum: &Pnum) -> ServerResult<&PolicyConfig> {
        self.per_tenant
            .get(pnum.as_str())
            .or_else(|| self.per_tenant.get("default"))
            .ok_or(ServerError::InternalServerError)
    }
}

/// The outcome of a policy check: whether the file may be exported, its
/// detected MIME type, and its size (both reported even on rejection, for
/// directory-listing purposes).
pub struct Decision {
    pub allowed: bool,
    pub mime_type: String,
    pub size: u64,
    pub reason: Option<String>,
}

/// Checks whether `path` may be exported under `policy` for tenant `pnum`.
pub async fn check(policy: &ExportPolicyConfig, path: &Path, pnum: &Pnum) -> ServerResult<Decision> {
    let basename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(ServerError::FilenameInvalid)?;
    Filename::new(basename).map_err(|_| ServerError::FilenameInvalid)?;

    let metadata = tokio::fs::metadata(path).await.map_err(ServerError::storage_error)?;
    let size = metadata.len();
    let mime_type = mime::guess(path);

    let tenant_policy = policy.policy_for(pnum)?;

    if !tenant_policy.enabled {
        return Ok(Decision {
            allowed: true,
            mime_type,
            size,
            reason: None,
        });
    }

    if !tenant_policy
        .allowed_mime_types
        .iter()
        .any(|m| m == "*" || m == &mime_type)
    {
        let reason = format!("not allowed to export file with MIME type: {mime_type}");
        return Ok(Decision {
            allowed: false,
            mime_type,
            size,
            reason: Some(reason),
        });
    }

    if let Some(max_size) = tenant_policy.max_size {
        if size > max_size {
            let gib = max_size as f64 / 1024.0 / 1024.0 / 1024.0;
            let reason = format!("File size exceeds maximum allowed for {}: {:.2} Gigabyte", pnum, gib);
            return Ok(Decision {
                allowed: false,
                mime_type,
                size,
                reason: Some(reason),
            });
        }
    }

    Ok(Decision {
        allowed: true,
        mime_type,
        size,
        reason: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn policy(enabled: bool, allowed: &[&str], max_size: Option<u64>) -> ExportPolicyConfig {
        let mut per_tenant = HashMap::new();
        per_tenant.insert(
            "default".to_owned(),
            PolicyConfig {
                enabled,
                allowed_mime_types: allowed.iter().map(|s| s.to_string()).collect(),
                max_size,
            },
        );
        ExportPolicyConfig { per_tenant }
    }

    #[tokio::test]
    async fn test_disabled_policy_allows_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let p = policy(false, &[], None);
        let pnum = Pnum::new("p11").unwrap();
        let decision = check(&p, &path, &pnum).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_mime_rejection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.png");
        tokio::fs::write(&path, b"\x89PNG").await.unwrap();

        let p = policy(true, &["text/plain"], None);
        let pnum = Pnum::new("p11").unwrap();
        let decision = check(&p, &path, &pnum).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("not allowed to export"));
    }

    #[tokio::test]
    async fn test_size_rejection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();

        let p = policy(true, &["*"], Some(10));
        let pnum = Pnum::new("p11").unwrap();
        let decision = check(&p, &path, &pnum).await.unwrap();
        assert!(!decision.allowed);
    }
}
