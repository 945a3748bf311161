//! Database manifests and the addresses derived from them.

use std::{fmt, str::FromStr};

use bytes::Bytes;
use orbit_base::Hash;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const ADDRESS_PREFIX: &str = "/orbitdb/";
const ACCESS_PREFIX: &str = "/ipfs/";

/// The kind of store a database is.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StoreType {
    /// Append only sequence of values.
    EventLog,
    /// Sequence of values that can be removed again.
    Feed,
    /// Map from keys to values, last write wins.
    KeyValue,
    /// JSON documents indexed by a field.
    DocStore,
    /// Grow-only counter.
    Counter,
}

impl StoreType {
    /// Parse a type name, failing with [`Error::InvalidType`].
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse()
            .map_err(|_| Error::InvalidType(name.to_string()))
    }
}

/// Immutable description of a database. Its content id is the root of the [`Address`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StoreType,
    /// `/ipfs/<hash>` of the access controller manifest.
    pub access_controller: String,
}

impl Manifest {
    pub fn new(name: impl Into<String>, kind: StoreType, access_manifest: Hash) -> Self {
        Manifest {
            name: name.into(),
            kind,
            access_controller: format!("{ACCESS_PREFIX}{access_manifest}"),
        }
    }

    /// Content id of the access controller manifest.
    pub fn access_manifest(&self) -> Result<Hash, Error> {
        self.access_controller
            .strip_prefix(ACCESS_PREFIX)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                Error::CorruptEntry(format!(
                    "invalid access controller address '{}'",
                    self.access_controller
                ))
            })
    }

    pub fn to_bytes(&self) -> Bytes {
        // a struct of strings always serializes
        serde_json::to_vec(self).map(Bytes::from).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(bytes).map_err(|err| Error::CorruptEntry(format!("manifest: {err}")))
    }

    /// Content id of this manifest.
    pub fn hash(&self) -> Hash {
        Hash::new(self.to_bytes())
    }

    /// Address of the database described by this manifest.
    pub fn address(&self) -> Address {
        Address::new(self.hash(), self.name.clone())
    }
}

/// Check that `name` can name a database.
///
/// Names become part of the local state path, so they must be relative and free of empty,
/// `.` and `..` components.
pub fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.contains(['\\', '\0'])
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if !valid {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Address of a database: `/orbitdb/<manifest id>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address {
    root: Hash,
    path: String,
}

impl Address {
    pub fn new(root: Hash, path: impl Into<String>) -> Self {
        Address {
            root,
            path: path.into(),
        }
    }

    /// Content id of the manifest.
    pub fn root(&self) -> Hash {
        self.root
    }

    /// Database name.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether `s` parses as an address.
    pub fn is_valid(s: &str) -> bool {
        s.parse::<Address>().is_ok()
    }

    /// Short form for logging.
    pub fn fmt_short(&self) -> String {
        format!("{}/{}", self.root.fmt_short(), self.path)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ADDRESS_PREFIX}{}/{}", self.root, self.path)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let rest = s.strip_prefix(ADDRESS_PREFIX).ok_or_else(invalid)?;
        let (root, path) = rest.split_once('/').ok_or_else(invalid)?;
        validate_name(path).map_err(|_| invalid())?;
        let root = root.parse().map_err(|_| invalid())?;
        Ok(Address::new(root, path))
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
