//! Filename validation.
//!
//! A filename never contains path separators or traversal segments; it is
//! validated by a whitelist regex before any filesystem operation (spec
//! property P2: any `/`, `..`, NUL byte, or otherwise out-of-whitelist byte
//! is rejected with `FILENAME_INVALID`/`SUBPATH_ATTEMPT`).

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

lazy_static! {
    static ref FILENAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,253}$").unwrap();
}

/// A validated filename with no path separators or traversal segments.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Filename(#[serde(deserialize_with = "Filename::deserialize")] String);

impl Filename {
    /// Validates and wraps a filename.
    ///
    /// Rejects anything containing `/`, a NUL byte, a leading dot (which
    /// would otherwise let `..` slip through the regex's character class),
    /// or a byte outside the whitelist.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        validate_filename(&name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_filename(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Filename {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::new(s)
    }
}

fn validate_filename(name: &str) -> CoreResult<()> {
    if name.contains('\0') || name.contains('/') || name == ".." {
        return Err(CoreError::InvalidFilename {
            name: name.to_owned(),
            reason: "path separators, NUL bytes and traversal segments are not allowed",
        });
    }

    if FILENAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(CoreError::InvalidFilename {
            name: name.to_owned(),
            reason: "must start with an alphanumeric and contain only alphanumerics, '.', '_' or '-'",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_filenames() {
        for name in ["hello.bin", "x.bin", "archive.tar.gz", "a", "A-1_2.3"] {
            assert_eq!(name, Filename::new(name).unwrap().as_str());
        }
    }

    #[test]
    fn test_invalid_filenames() {
        for name in [
            "",
            "../etc/passwd",
            "..",
            "a/b",
            "/etc/passwd",
            "a\0b",
            ".hidden",
            "has space",
        ] {
            Filename::new(name).unwrap_err();
        }
    }
}
