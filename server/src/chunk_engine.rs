//! ChunkEngine: classification, append-merge, and torn-merge repair for
//! resumable uploads.
//!
//! Grounded on `original_source/tsdfileapi/api.py`'s `handle_resumable_request`,
//! `merge_resumables`, and `repair_inconsistent_resumable`, translated from
//! Tornado's synchronous-handler style into `async fn`s over `tokio::fs`.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{ServerError, ServerResult};
use crate::resumable::ResumableStore;

/// The `chunk` query parameter: either a 1-based sequence number or `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkParam {
    Num(u32),
    End,
}

impl ChunkParam {
    pub fn parse(raw: &str) -> ServerResult<Self> {
        if raw == "end" {
            Ok(Self::End)
        } else {
            raw.parse()
                .map(Self::Num)
                .map_err(|_| ServerError::PolicyRejected("invalid chunk parameter".to_owned()))
        }
    }
}

/// The engine's view of a single chunk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// First chunk: mint a fresh upload id.
    New,
    /// A middle chunk of an in-progress upload.
    Growing { upload_id: String },
    /// The final (`chunk=end`) request.
    Finalizing { upload_id: String },
}

/// Classifies a chunk request and, for `GROWING`, enforces sequential order.
pub async fn classify(
    tenant_dir: &Path,
    chunk: ChunkParam,
    id: Option<&str>,
) -> ServerResult<Classification> {
    match (chunk, id) {
        // A stray `id` alongside chunk=1 is disregarded, not an error: the
        // first chunk of an upload always mints a fresh id.
        (ChunkParam::Num(1), _) => Ok(Classification::New),
        (ChunkParam::Num(n), Some(upload_id)) if n > 1 => {
            let chunks_dir = chunks_dir(tenant_dir, upload_id);
            let highest = highest_chunk_on_disk(&chunks_dir).await?;
            if highest != n - 1 {
                return Err(ServerError::ChunkOutOfOrder);
            }
            Ok(Classification::Growing {
                upload_id: upload_id.to_owned(),
            })
        }
        (ChunkParam::End, Some(upload_id)) => Ok(Classification::Finalizing {
            upload_id: upload_id.to_owned(),
        }),
        _ => Err(ServerError::PolicyRejected(
            "invalid chunk/id combination".to_owned(),
        )),
    }
}

fn chunks_dir(tenant_dir: &Path, upload_id: &str) -> PathBuf {
    tenant_dir.join(upload_id)
}

fn merged_path(tenant_dir: &Path, filename: &str, upload_id: &str) -> PathBuf {
    tenant_dir.join(format!("{filename}.{upload_id}"))
}

fn final_path(tenant_dir: &Path, filename: &str) -> PathBuf {
    tenant_dir.join(filename)
}

fn chunk_path(chunks_dir: &Path, filename: &str, n: u32) -> PathBuf {
    chunks_dir.join(format!("{filename}.chunk.{n}"))
}

/// Part-file name a chunk's body is received into before it's renamed into
/// place (spec §4.5 "Filename guarding").
pub fn chunk_part_path(chunks_dir_path: &Path, filename: &str, n: u32) -> PathBuf {
    let mut p = chunk_path(chunks_dir_path, filename, n).into_os_string();
    p.push(".part");
    PathBuf::from(p)
}

/// Highest `n` among completed (non-`.part`) chunk files, or 0 if none.
async fn highest_chunk_on_disk(dir: &Path) -> ServerResult<u32> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(ServerError::storage_error(e)),
    };

    let mut highest = 0;
    while let Some(entry) = read_dir.next_entry().await.map_err(ServerError::storage_error)? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".part") {
            continue;
        }
        if let Some(idx) = name.rfind(".chunk.") {
            if let Ok(n) = name[idx + ".chunk.".len()..].parse::<u32>() {
                highest = highest.max(n);
            }
        }
    }

    Ok(highest)
}

/// Begins a new resumable: creates `<upload_id>/` and the store record.
/// Returns the fresh `upload_id`.
pub async fn begin(
    store: &ResumableStore,
    tenant_dir: &Path,
    user: &str,
    group: &str,
) -> ServerResult<String> {
    let upload_id = uuid::Uuid::new_v4().to_string();

    fs::create_dir_all(chunks_dir(tenant_dir, &upload_id))
        .await
        .map_err(ServerError::storage_error)?;
    store.insert(tenant_dir, user, &upload_id, group).await?;

    Ok(upload_id)
}

/// Runs the append-merge protocol (spec §4.4 steps 2-9) for a chunk whose
/// body has already landed at `chunk_part_path(...)`.
///
/// Returns the new highest chunk number (always `n`, since order is
/// enforced by [`classify`] before the body is even read).
pub async fn commit_chunk(
    store: &ResumableStore,
    tenant_dir: &Path,
    user: &str,
    upload_id: &str,
    filename: &str,
    n: u32,
) -> ServerResult<u32> {
    let chunks_dir_path = chunks_dir(tenant_dir, upload_id);
    let part = chunk_part_path(&chunks_dir_path, filename, n);
    let chunk = chunk_path(&chunks_dir_path, filename, n);

    if fs::try_exists(&chunk).await.unwrap_or(false) {
        return Err(ServerError::ChunkDuplicate);
    }
    fs::rename(&part, &chunk)
        .await
        .map_err(ServerError::storage_error)?;

    let merged = merged_path(tenant_dir, filename, upload_id);
    let lock = {
        let mut p = merged.clone().into_os_string();
        p.push(".lock");
        PathBuf::from(p)
    };

    if n > 1 {
        // Sentinel lock: a hard link to the merged file. NFS-safe mutual
        // exclusion without relying on advisory locking. `hard_link` fails
        // with `AlreadyExists` if another append-merge already holds it.
        if let Err(e) = fs::hard_link(&merged, &lock).await {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(ServerError::storage_error(e));
            }
            return Err(ServerError::PolicyRejected(
                "another request is already merging this upload".to_owned(),
            ));
        }
    }

    let result = append_chunk(&merged, &chunk).await;

    if n > 1 {
        fs::remove_file(&lock).await.ok();
    }

    let chunk_size = match result {
        Ok(size_after) => {
            let chunk_size = fs::metadata(&chunk)
                .await
                .map_err(ServerError::storage_error)?
                .len();
            let _ = size_after;
            chunk_size
        }
        Err((size_before, e)) => {
            // Roll back: drop the chunk, restore the merged file's size.
            fs::remove_file(&chunk).await.ok();
            if let Ok(f) = fs::OpenOptions::new().write(true).open(&merged).await {
                f.set_len(size_before).await.ok();
            }
            return Err(e);
        }
    };

    store
        .record_chunk(tenant_dir, user, upload_id, n as i32, chunk_size as i64)
        .await?;

    if n >= 5 {
        let stale = chunk_path(&chunks_dir_path, filename, n - 4);
        fs::remove_file(&stale).await.ok();
    }

    Ok(n)
}

/// Appends `chunk`'s bytes onto `merged` (creating it if absent). On
/// success returns the pre-append size; on failure returns it as the
/// rollback target alongside the error.
async fn append_chunk(merged: &Path, chunk: &Path) -> Result<u64, (u64, ServerError)> {
    let size_before = fs::metadata(merged).await.map(|m| m.len()).unwrap_or(0);

    let run = async {
        let mut out = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(merged)
            .await
            .map_err(ServerError::storage_error)?;
        let mut input = fs::File::open(chunk).await.map_err(ServerError::storage_error)?;
        tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(ServerError::storage_error)?;
        out.flush().await.map_err(ServerError::storage_error)?;
        Ok(())
    }
    .await;

    match run {
        Ok(()) => Ok(size_before),
        Err(e) => Err((size_before, e)),
    }
}

/// Finalizes a resumable: renames the merged file to its canonical name and
/// removes the chunk directory (best-effort). The caller is responsible for
/// removing the store record.
pub async fn finalize(tenant_dir: &Path, filename: &str, upload_id: &str) -> ServerResult<PathBuf> {
    let merged = merged_path(tenant_dir, filename, upload_id);
    let target = final_path(tenant_dir, filename);

    fs::rename(&merged, &target)
        .await
        .map_err(ServerError::storage_error)?;

    let dir = chunks_dir(tenant_dir, upload_id);
    if let Err(e) = fs::remove_dir_all(&dir).await {
        tracing::warn!(upload_id, error = %e, "failed to remove resumable chunk directory");
    }

    Ok(target)
}

/// Resumable-info response fields (spec §6.1).
#[derive(Debug, Clone, Serialize)]
pub struct ResumableInfo {
    pub filename: String,
    pub id: String,
    pub chunk_size: Option<u64>,
    pub max_chunk: Option<u32>,
    pub md5sum: Option<String>,
    pub previous_offset: Option<u64>,
    pub next_offset: u64,
    pub warning: Option<String>,
    pub recommendation: Option<String>,
    pub group: Option<String>,
}

/// Computes resumable info for `upload_id`, repairing a torn merge first if
/// one is detected (spec §4.4 "Torn-merge repair").
pub async fn info(
    store: &ResumableStore,
    tenant_dir: &Path,
    user: &str,
    filename: &str,
    upload_id: &str,
) -> ServerResult<ResumableInfo> {
    let group = store.group_of(tenant_dir, user, upload_id).await?;
    let total = store.total_size(tenant_dir, user, upload_id).await? as u64;
    let chunks_dir_path = chunks_dir(tenant_dir, upload_id);
    let max_chunk = highest_chunk_on_disk(&chunks_dir_path).await?;

    if max_chunk == 0 {
        return Ok(ResumableInfo {
            filename: filename.to_owned(),
            id: upload_id.to_owned(),
            chunk_size: None,
            max_chunk: None,
            md5sum: None,
            previous_offset: None,
            next_offset: total,
            warning: None,
            recommendation: None,
            group,
        });
    }

    let merged = merged_path(tenant_dir, filename, upload_id);
    let merged_size = fs::metadata(&merged).await.map(|m| m.len()).unwrap_or(0);
    let last_chunk = chunk_path(&chunks_dir_path, filename, max_chunk);
    let last_chunk_size = fs::metadata(&last_chunk).await.map(|m| m.len()).unwrap_or(0);

    let (warning, recommendation) = if merged_size == total {
        (None, None)
    } else if merged_size < total && (total - merged_size) <= last_chunk_size {
        match repair_torn_merge(&merged, &last_chunk, total, last_chunk_size).await {
            Ok(()) => (None, None),
            Err(()) => (
                Some("inconsistent".to_owned()),
                Some("end".to_owned()),
            ),
        }
    } else {
        // merged_size > total: a double-append happened; nothing safe to
        // repair automatically.
        (None, Some("end".to_owned()))
    };

    let last_chunk_md5 = md5_hex(&last_chunk).await.ok();
    let previous_offset = total.saturating_sub(last_chunk_size);

    Ok(ResumableInfo {
        filename: filename.to_owned(),
        id: upload_id.to_owned(),
        chunk_size: Some(last_chunk_size),
        max_chunk: Some(max_chunk),
        md5sum: last_chunk_md5,
        previous_offset: Some(previous_offset),
        next_offset: total,
        warning,
        recommendation,
        group,
    })
}

async fn repair_torn_merge(
    merged: &Path,
    last_chunk: &Path,
    total: u64,
    last_chunk_size: u64,
) -> Result<(), ()> {
    let target_size = total - last_chunk_size;

    let repaired = async {
        let f = fs::OpenOptions::new()
            .write(true)
            .open(merged)
            .await
            .map_err(|_| ())?;
        f.set_len(target_size).await.map_err(|_| ())?;
        drop(f);

        let mut out = fs::OpenOptions::new()
            .append(true)
            .open(merged)
            .await
            .map_err(|_| ())?;
        let mut input = fs::File::open(last_chunk).await.map_err(|_| ())?;
        tokio::io::copy(&mut input, &mut out).await.map_err(|_| ())?;
        out.flush().await.map_err(|_| ())?;

        let new_size = fs::metadata(merged).await.map_err(|_| ())?.len();
        if new_size == total {
            Ok(())
        } else {
            Err(())
        }
    }
    .await;

    repaired
}

async fn md5_hex(path: &Path) -> ServerResult<String> {
    let bytes = fs::read(path).await.map_err(ServerError::storage_error)?;
    let mut hasher = Md5::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Discovers the most recently started resumable matching `filename` among
/// a user's in-progress uploads (spec §4.4 "Discovery by filename").
pub async fn discover_by_filename(
    store: &ResumableStore,
    tenant_dir: &Path,
    user: &str,
    filename: &str,
) -> ServerResult<Option<String>> {
    let mut candidates = Vec::new();

    for upload_id in store.list_ids(tenant_dir, user).await? {
        let dir = chunks_dir(tenant_dir, &upload_id);
        let Ok(metadata) = fs::metadata(&dir).await else {
            continue;
        };
        let first_chunk = chunk_path(&dir, filename, 1);
        if fs::try_exists(&first_chunk).await.unwrap_or(false) {
            let mtime = metadata.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            candidates.push((mtime, upload_id));
        }
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(candidates.into_iter().next().map(|(_, id)| id))
}

/// Removes a resumable's on-disk state and store record, verifying
/// ownership first.
pub async fn delete(
    store: &ResumableStore,
    tenant_dir: &Path,
    user: &str,
    filename: &str,
    upload_id: &str,
) -> ServerResult<()> {
    if !store.belongs_to(tenant_dir, user, upload_id).await? {
        return Err(ServerError::NotFound);
    }

    let dir = chunks_dir(tenant_dir, upload_id);
    fs::remove_dir_all(&dir).await.ok();
    let merged = merged_path(tenant_dir, filename, upload_id);
    fs::remove_file(&merged).await.ok();

    store.delete(tenant_dir, user, upload_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_classify_new() {
        let dir = tempdir().unwrap();
        let c = classify(dir.path(), ChunkParam::Num(1), None).await.unwrap();
        assert_eq!(c, Classification::New);
    }

    #[tokio::test]
    async fn test_classify_new_disregards_stray_id() {
        let dir = tempdir().unwrap();
        let c = classify(dir.path(), ChunkParam::Num(1), Some("stale-upload-id")).await.unwrap();
        assert_eq!(c, Classification::New);
    }

    #[tokio::test]
    async fn test_classify_growing_enforces_order() {
        let dir = tempdir().unwrap();
        let chunks = chunks_dir(dir.path(), "u1");
        fs::create_dir_all(&chunks).await.unwrap();
        fs::write(chunk_path(&chunks, "x.bin", 1), b"a").await.unwrap();

        let ok = classify(dir.path(), ChunkParam::Num(2), Some("u1")).await;
        assert!(matches!(ok, Ok(Classification::Growing { .. })));

        let rejected = classify(dir.path(), ChunkParam::Num(3), Some("u1")).await;
        assert!(matches!(rejected, Err(ServerError::ChunkOutOfOrder)));
    }

    #[tokio::test]
    async fn test_append_merge_and_finalize() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();

        let upload_id = begin(&store, dir.path(), "alice", "p11-member-group")
            .await
            .unwrap();
        let chunks = chunks_dir(dir.path(), &upload_id);

        fs::write(chunk_part_path(&chunks, "x.bin", 1), vec![b'A'; 100])
            .await
            .unwrap();
        commit_chunk(&store, dir.path(), "alice", &upload_id, "x.bin", 1)
            .await
            .unwrap();

        fs::write(chunk_part_path(&chunks, "x.bin", 2), vec![b'B'; 100])
            .await
            .unwrap();
        commit_chunk(&store, dir.path(), "alice", &upload_id, "x.bin", 2)
            .await
            .unwrap();

        assert_eq!(
            store.total_size(dir.path(), "alice", &upload_id).await.unwrap(),
            200
        );

        let final_file = finalize(dir.path(), "x.bin", &upload_id).await.unwrap();
        let contents = fs::read(&final_file).await.unwrap();
        assert_eq!(contents.len(), 200);
        assert!(contents[..100].iter().all(|&b| b == b'A'));
        assert!(contents[100..].iter().all(|&b| b == b'B'));
    }

    #[tokio::test]
    async fn test_commit_chunk_rejects_while_lock_held() {
        let dir = tempdir().unwrap();
        let store = ResumableStore::new();

        let upload_id = begin(&store, dir.path(), "alice", "p11-member-group")
            .await
            .unwrap();
        let chunks = chunks_dir(dir.path(), &upload_id);

        fs::write(chunk_part_path(&chunks, "x.bin", 1), vec![b'A'; 10])
            .await
            .unwrap();
        commit_chunk(&store, dir.path(), "alice", &upload_id, "x.bin", 1)
            .await
            .unwrap();

        let merged = merged_path(dir.path(), "x.bin", &upload_id);
        let lock = {
            let mut p = merged.clone().into_os_string();
            p.push(".lock");
            PathBuf::from(p)
        };
        fs::hard_link(&merged, &lock).await.unwrap();

        fs::write(chunk_part_path(&chunks, "x.bin", 2), vec![b'B'; 10])
            .await
            .unwrap();
        let err = commit_chunk(&store, dir.path(), "alice", &upload_id, "x.bin", 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::PolicyRejected(_)));
    }
}
