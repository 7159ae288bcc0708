//! PathResolver: mapping `(backend, tenant)` to an absolute directory.
//!
//! A backend is a named directory template configured under
//! `[backends.disk.<name>]`. Every path in the template may contain the
//! literal placeholder `pXX`, substituted with the tenant's pnum.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;

use filegate_core::tenant::Pnum;

use crate::error::{ServerError, ServerResult};

const PNUM_PLACEHOLDER: &str = "pXX";

/// A single backend's directory configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Template for the directory uploads land in.
    #[serde(rename = "import-path")]
    pub import_path: String,

    /// Template for the directory downloads are served from.
    #[serde(rename = "export-path")]
    pub export_path: String,

    /// Optional sub-folder appended under the resolved import directory.
    #[serde(rename = "subfolder-path")]
    pub subfolder_path: Option<String>,

    /// Template used instead of `import_path`/`export_path` for the
    /// privileged admin tenant.
    #[serde(rename = "admin-path")]
    pub admin_path: Option<String>,

    /// Request hook invoked after a successful upload through this backend.
    #[serde(rename = "request-hook")]
    pub request_hook: Option<RequestHookConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestHookConfig {
    pub path: PathBuf,
}

/// Which directory role to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Import,
    Export,
}

/// Substitutes `pXX` with the tenant id and, for the admin tenant, prefers
/// `admin_path` over the direction-specific template (spec §4.2).
pub fn resolve(backend: &BackendConfig, pnum: &Pnum, direction: Direction) -> PathBuf {
    let template = if pnum.is_admin() {
        backend
            .admin_path
            .as_deref()
            .unwrap_or(match direction {
                Direction::Import => &backend.import_path,
                Direction::Export => &backend.export_path,
            })
    } else {
        match direction {
            Direction::Import => &backend.import_path,
            Direction::Export => &backend.export_path,
        }
    };

    let substituted = template.replace(PNUM_PLACEHOLDER, pnum.as_str());
    let mut path = PathBuf::from(substituted);

    if direction == Direction::Import && !pnum.is_admin() {
        if let Some(subfolder) = &backend.subfolder_path {
            path.push(subfolder.replace(PNUM_PLACEHOLDER, pnum.as_str()));
        }
    }

    path
}

/// Resolves the import directory, creating it (and setting a
/// tenant-appropriate, non-privilege-escalating mode) if missing.
///
/// Creation only happens for non-admin tenants writing through the
/// `cluster` backend, matching the teacher's on-demand directory
/// provisioning for multi-tenant uploads.
pub async fn resolve_and_create_import_dir(
    backend_name: &str,
    backend: &BackendConfig,
    pnum: &Pnum,
) -> ServerResult<PathBuf> {
    let path = resolve(backend, pnum, Direction::Import);

    if backend_name == "cluster" && !pnum.is_admin() {
        if !path_exists(&path).await {
            fs::create_dir_all(&path)
                .await
                .map_err(ServerError::storage_error)?;
            // 0o750: owner rwx, group rx, no world access. Never escalate
            // beyond what the server process itself already holds.
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o750))
                .await
                .map_err(ServerError::storage_error)?;
        }
    }

    Ok(path)
}

async fn path_exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> BackendConfig {
        BackendConfig {
            import_path: "/data/pXX/import".to_owned(),
            export_path: "/data/pXX/export".to_owned(),
            subfolder_path: Some("incoming".to_owned()),
            admin_path: Some("/data/admin".to_owned()),
            request_hook: None,
        }
    }

    #[test]
    fn test_substitution() {
        let pnum = Pnum::new("p11").unwrap();
        assert_eq!(
            resolve(&backend(), &pnum, Direction::Export),
            PathBuf::from("/data/p11/export")
        );
    }

    #[test]
    fn test_subfolder() {
        let pnum = Pnum::new("p11").unwrap();
        assert_eq!(
            resolve(&backend(), &pnum, Direction::Import),
            PathBuf::from("/data/p11/import/incoming")
        );
    }

    #[test]
    fn test_admin_override() {
        let pnum = Pnum::new("p01").unwrap();
        assert_eq!(
            resolve(&backend(), &pnum, Direction::Import),
            PathBuf::from("/data/admin")
        );
    }
}
