//! The VM identifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::IdError;

/// Identifier of a microVM, assigned at create time and never changed.
///
/// Ordering follows the embedded ULID, so later IDs compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct VmId(Ulid);

impl VmId {
    pub const PREFIX: &'static str = "vm";

    /// A fresh ID stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Milliseconds since the epoch at which the ID was minted.
    pub fn created_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Stem for the VM's files under the socket directory.
    pub fn file_stem(&self) -> String {
        self.to_string()
    }

    /// Parse the `vm_<ULID>` form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let (prefix, ulid) = match s.split_once('_') {
            Some(parts) => parts,
            None if s.is_empty() => return Err(IdError::Empty),
            None => return Err(IdError::MissingSeparator),
        };
        if prefix != Self::PREFIX {
            return Err(IdError::InvalidPrefix {
                expected: Self::PREFIX,
                actual: prefix.to_owned(),
            });
        }
        Ulid::from_string(ulid)
            .map(Self)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

impl Default for VmId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for VmId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for VmId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}
