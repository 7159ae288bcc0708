//! Tenant (project number) identifiers.
//!
//! Every request URI carries a `pnum`; every file operation is scoped to
//! that tenant's directory tree. Conventionally `p\d+`, possibly with a
//! dash-separated modifier (e.g. a clone suffix).

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

lazy_static! {
    static ref PNUM_REGEX: Regex = Regex::new(r"^p[0-9]+(-[a-z0-9]+)?$").unwrap();
}

/// The privileged tenant id used for the cluster admin path.
pub const ADMIN_PNUM: &str = "p01";

/// A validated tenant (project number) identifier.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Pnum(#[serde(deserialize_with = "Pnum::deserialize")] String);

impl Pnum {
    /// Validates and wraps a tenant id.
    pub fn new(pnum: impl Into<String>) -> CoreResult<Self> {
        let pnum = pnum.into();
        validate_pnum(&pnum)?;
        Ok(Self(pnum))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the privileged cluster-admin tenant.
    pub fn is_admin(&self) -> bool {
        self.0 == ADMIN_PNUM
    }

    fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error;
        String::deserialize(deserializer).and_then(|s| {
            validate_pnum(&s).map_err(|e| Error::custom(e.to_string()))?;
            Ok(s)
        })
    }
}

impl fmt::Display for Pnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Pnum {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::new(s)
    }
}

fn validate_pnum(pnum: &str) -> CoreResult<()> {
    if PNUM_REGEX.is_match(pnum) {
        Ok(())
    } else {
        Err(CoreError::InvalidTenant {
            pnum: pnum.to_owned(),
            reason: "must match p\\d+ with an optional dash-separated modifier",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pnums() {
        for pnum in ["p11", "p01", "p2000", "p11-clone"] {
            assert_eq!(pnum, Pnum::new(pnum).unwrap().as_str());
        }
    }

    #[test]
    fn test_invalid_pnums() {
        for pnum in ["", "11", "P11", "p-11", "p11/..", "p11 "] {
            Pnum::new(pnum).unwrap_err();
        }
    }

    #[test]
    fn test_admin_pnum() {
        assert!(Pnum::new("p01").unwrap().is_admin());
        assert!(!Pnum::new("p02").unwrap().is_admin());
    }
}
