//! DownloadStreamer: directory listing and single-file range-aware download
//! serving from an export directory (spec §4.7).
//!
//! Grounded on `original_source/tsdfileapi/api.py`'s `FileStreamerHandler`
//! (`list_files`, `compute_etag`, `get`).

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use nix::unistd::{Uid, User};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use filegate_core::filename::Filename;
use filegate_core::tenant::Pnum;

use crate::error::{ServerError, ServerResult};
use crate::export_policy::{self, ExportPolicyConfig};

/// One entry in an export directory listing.
#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub filename: String,
    pub size: u64,
    pub mtime: String,
    pub href: String,
    pub exportable: bool,
    pub reason: Option<String>,
    #[serde(rename = "mime-type")]
    pub mime_type: String,
    pub owner: Option<String>,
}

/// Lists `export_dir`'s entries, evaluating export eligibility for each
/// regular file. Directories are always reported `exportable: false`.
pub async fn list(
    export_dir: &Path,
    policy: &ExportPolicyConfig,
    pnum: &Pnum,
    href_prefix: &str,
    max_entries: usize,
) -> ServerResult<Vec<FileEntry>> {
    let mut read_dir = match tokio::fs::read_dir(export_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ServerError::storage_error(e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(ServerError::storage_error)? {
        names.push(entry.file_name());
    }

    if names.len() > max_entries {
        return Err(ServerError::PolicyRejected("too many files".to_owned()));
    }

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let name = match name.to_str() {
            Some(n) => n,
            None => continue,
        };
        let path = export_dir.join(name);
        let metadata = tokio::fs::metadata(&path).await.map_err(ServerError::storage_error)?;
        let mtime = mtime_rfc3339(&metadata);
        let owner = owner_name(metadata.uid());
        let href = format!("{}/{}", href_prefix.trim_end_matches('/'), name);

        if metadata.is_dir() {
            entries.push(FileEntry {
                filename: name.to_owned(),
                size: metadata.len(),
                mtime,
                href,
                exportable: false,
                reason: Some("directories cannot be exported".to_owned()),
                mime_type: filegate_core::mime::OCTET_STREAM.to_owned(),
                owner,
            });
            continue;
        }

        let decision = export_policy::check(policy, &path, pnum).await?;
        entries.push(FileEntry {
            filename: name.to_owned(),
            size: decision.size,
            mtime,
            href,
            exportable: decision.allowed,
            reason: decision.reason,
            mime_type: decision.mime_type,
            owner,
        });
    }

    Ok(entries)
}

fn mtime_rfc3339(metadata: &std::fs::Metadata) -> String {
    match metadata.modified() {
        Ok(t) => {
            let datetime: DateTime<Utc> = t.into();
            datetime.to_rfc3339()
        }
        Err(_) => DateTime::<Utc>::from(UNIX_EPOCH).to_rfc3339(),
    }
}

fn owner_name(uid: u32) -> Option<String> {
    User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|u| u.name)
}

/// The strong validator for a file: `md5(stringify(mtime))`, matching the
/// teacher's `compute_etag`.
pub async fn etag_for(path: &Path) -> ServerResult<String> {
    let metadata = tokio::fs::metadata(path).await.map_err(ServerError::storage_error)?;
    let mtime = mtime_rfc3339(&metadata);
    let mut hasher = Md5::new();
    hasher.update(mtime.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// A validated, inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses a `Range: bytes=a-b` header against a known file size.
///
/// A comma (multiple ranges) is rejected as unsupported; `b` beyond the
/// file's last byte is unsatisfiable.
pub fn parse_range(header: &str, size: u64) -> ServerResult<ByteRange> {
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| ServerError::PolicyRejected("malformed Range header".to_owned()))?;

    if spec.contains(',') {
        return Err(ServerError::RangeMultipart);
    }

    let (start_s, end_s) = spec
        .split_once('-')
        .ok_or_else(|| ServerError::PolicyRejected("malformed Range header".to_owned()))?;

    let start: u64 = start_s
        .parse()
        .map_err(|_| ServerError::PolicyRejected("malformed Range start".to_owned()))?;
    let end: u64 = if end_s.is_empty() {
        size.saturating_sub(1)
    } else {
        end_s
            .parse()
            .map_err(|_| ServerError::PolicyRejected("malformed Range end".to_owned()))?
    };

    if end > size || start > end {
        return Err(ServerError::RangeUnsatisfiable);
    }

    Ok(ByteRange { start, end })
}

/// What a single-file download request resolves to, once policy, filename
/// and range validation have all passed.
pub struct Download {
    pub path: PathBuf,
    pub mime_type: String,
    pub etag: String,
    pub total_size: u64,
    pub range: Option<ByteRange>,
}

/// Runs filename validation, existence check, and `ExportPolicy.check` for
/// a single-file request; does not open the file.
pub async fn resolve(export_dir: &Path, filename: &str, policy: &ExportPolicyConfig, pnum: &Pnum) -> ServerResult<(PathBuf, String, u64)> {
    Filename::new(filename).map_err(|_| ServerError::FilenameInvalid)?;
    let path = export_dir.join(filename);

    if tokio::fs::metadata(&path).await.is_err() {
        return Err(ServerError::NotFound);
    }

    let decision = export_policy::check(policy, &path, pnum).await?;
    if !decision.allowed {
        let reason = decision.reason.unwrap_or_else(|| "export not permitted".to_owned());
        return Err(ServerError::PolicyRejected(reason));
    }

    Ok((path, decision.mime_type, decision.size))
}

/// Validates an optional `Range`/`If-Range` pair against a resolved file,
/// yielding the range to serve (`None` for the whole file).
pub async fn negotiate_range(
    path: &Path,
    total_size: u64,
    range_header: Option<&str>,
    if_range_header: Option<&str>,
) -> ServerResult<Option<ByteRange>> {
    let Some(range_header) = range_header else {
        return Ok(None);
    };

    let range = parse_range(range_header, total_size)?;

    if let Some(if_range) = if_range_header {
        let current_etag = etag_for(path).await?;
        if if_range.trim() != current_etag {
            return Err(ServerError::PolicyRejected(
                "If-Range does not match current file state; restart the download from scratch".to_owned(),
            ));
        }
    }

    Ok(Some(range))
}

/// Opens `path`, seeking to `range.start` if a range was negotiated, and
/// returns a reader bounded to the bytes that should be streamed.
pub async fn open_for_streaming(path: &Path, range: Option<ByteRange>) -> ServerResult<tokio::io::Take<tokio::fs::File>> {
    let mut file = tokio::fs::File::open(path).await.map_err(ServerError::storage_error)?;

    let (start, len) = match range {
        Some(r) => (r.start, r.len()),
        None => (0, file.metadata().await.map_err(ServerError::storage_error)?.len()),
    };

    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(ServerError::storage_error)?;
    }

    Ok(file.take(len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::export_policy::PolicyConfig;
    use tempfile::tempdir;

    fn open_policy() -> ExportPolicyConfig {
        let mut per_tenant = HashMap::new();
        per_tenant.insert(
            "default".to_owned(),
            PolicyConfig {
                enabled: false,
                allowed_mime_types: vec![],
                max_size: None,
            },
        );
        ExportPolicyConfig { per_tenant }
    }

    #[test]
    fn test_parse_range_defaults_end() {
        let r = parse_range("bytes=10-", 100).unwrap();
        assert_eq!(r, ByteRange { start: 10, end: 99 });
    }

    #[test]
    fn test_parse_range_rejects_comma() {
        parse_range("bytes=0-10,20-30", 100).unwrap_err();
    }

    #[test]
    fn test_parse_range_beyond_eof() {
        parse_range("bytes=0-200", 100).unwrap_err();
    }

    #[test]
    fn test_parse_range_end_equal_to_size_is_satisfiable() {
        let r = parse_range("bytes=0-100", 100).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 100 });
    }

    #[tokio::test]
    async fn test_list_reports_directories_unexportable() {
        let dir = tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();

        let pnum = Pnum::new("p11").unwrap();
        let entries = list(dir.path(), &open_policy(), &pnum, "/v1/p11/files/export", 100)
            .await
            .unwrap();

        let sub = entries.iter().find(|e| e.filename == "sub").unwrap();
        assert!(!sub.exportable);
        let file = entries.iter().find(|e| e.filename == "a.txt").unwrap();
        assert!(file.exportable);
    }

    #[tokio::test]
    async fn test_resolve_missing_file() {
        let dir = tempdir().unwrap();
        let pnum = Pnum::new("p11").unwrap();
        let err = resolve(dir.path(), "missing.txt", &open_policy(), &pnum).await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound));
    }
}
