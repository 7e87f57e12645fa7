use crate::error::Result;
use crate::Error;

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// `__<lo>_<hi>_<uuid>_<version>`: the timestamp range and format version of
/// a fragment, made unique by a random uuid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FragmentName {
    pub lo: u64,
    pub hi: u64,
    pub uuid: String,
    pub version: u32,
}

impl FragmentName {
    pub fn new(lo: u64, hi: u64, version: u32) -> Self {
        Self {
            lo,
            hi,
            uuid: Uuid::new_v4().simple().to_string(),
            version,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || Error::InvalidData(format!("invalid fragment name {}", name));

        let rest = name.strip_prefix("__").ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('_').collect();
        if parts.len() != 4 || parts[2].is_empty() {
            return Err(invalid());
        }
        let lo = parts[0].parse().map_err(|_| invalid())?;
        let hi = parts[1].parse().map_err(|_| invalid())?;
        let version = parts[3].parse().map_err(|_| invalid())?;
        if lo > hi {
            return Err(invalid());
        }

        Ok(Self {
            lo,
            hi,
            uuid: parts[2].to_string(),
            version,
        })
    }

    pub fn timestamp_range(&self) -> (u64, u64) {
        (self.lo, self.hi)
    }
}

impl fmt::Display for FragmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "__{}_{}_{}_{}", self.lo, self.hi, self.uuid, self.version)
    }
}

impl FromStr for FragmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Name for schema and array-metadata files: `__<lo>_<hi>_<uuid>`.
pub fn timestamped_name(lo: u64, hi: u64) -> String {
    format!("__{}_{}_{}", lo, hi, Uuid::new_v4().simple())
}

/// Timestamp range of a name produced by [`timestamped_name`].
pub fn parse_timestamped(name: &str) -> Option<(u64, u64)> {
    let mut parts = name.strip_prefix("__")?.split('_');
    let lo = parts.next()?.parse().ok()?;
    let hi = parts.next()?.parse().ok()?;
    parts.next()?;
    Some((lo, hi))
}
