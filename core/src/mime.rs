//! MIME type detection for exported files.

use std::path::Path;

/// The MIME type used when detection fails to identify a more specific type.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Guesses a file's MIME type from its extension.
///
/// This never fails: unrecognized extensions fall back to
/// [`OCTET_STREAM`], matching how export listings report a best-effort
/// type for every directory entry regardless of whether it's
/// ultimately exportable.
pub fn guess(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_owned()
}
