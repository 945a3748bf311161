//! Errors returned by database operations.

use orbit_base::{IdentityId, SigningError};
use orbit_oplog::{StoreError, access::AccessError, log::AppendError};

use crate::address::{Address, StoreType};

/// Error type for [`crate::OrbitDb`] and database handles.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown store type name.
    #[error("Invalid database type '{0}'")]
    InvalidType(String),
    /// An address was given where a name was expected.
    #[error("Given database name is an address. Please give only the name of the database!")]
    AddressNameConflict,
    /// Creating a database whose local state already exists.
    #[error("Database '{0}' already exists!")]
    DatabaseExists(Address),
    /// The manifest names a different store type than the one requested.
    #[error("Database '{address}' is type '{actual}' but was opened as '{requested}'")]
    TypeMismatch {
        address: Address,
        actual: StoreType,
        requested: StoreType,
    },
    /// The identity may not perform the operation.
    #[error("identity {0} is not allowed to perform this operation")]
    AccessDenied(IdentityId),
    /// Grant or revoke on an access controller fixed at creation.
    #[error("access controller is immutable")]
    ImmutableAccess,
    /// A blob failed to decode or verify.
    #[error("corrupt entry {0}")]
    CorruptEntry(String),
    /// Opening an address with `local_only` that has no local state.
    #[error("Database '{0}' doesn't exist!")]
    NotFoundLocally(Address),
    /// The local identity cannot sign.
    #[error(transparent)]
    SigningFailure(#[from] SigningError),
    /// Opening by name with `create` unset.
    #[error(
        "'options.create' set to 'false'. If you want to create a database, set 'options.create' to 'true'."
    )]
    CreateDisabled,
    /// Creating without a store type.
    #[error(
        "Database type not provided! Provide a type with 'options.type' (eventlog|feed|docstore|counter|keyvalue)"
    )]
    MissingType,
    /// Not a valid `/orbitdb/<manifest>/<name>` address.
    #[error("Not a valid OrbitDB address: {0}")]
    InvalidAddress(String),
    /// A name that cannot be used for a database.
    #[error("Invalid database name '{0}'")]
    InvalidName(String),
    /// The handle was closed.
    #[error("Database '{0}' is closed")]
    Closed(Address),
    /// Content store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Local state file failure.
    #[error("local state: {0}")]
    State(#[source] anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<AppendError> for Error {
    fn from(value: AppendError) -> Self {
        match value {
            AppendError::AccessDenied(id) => Error::AccessDenied(id),
            AppendError::Signing(err) => Error::SigningFailure(err),
            AppendError::Store(err) => Error::Store(err),
        }
    }
}

impl From<AccessError> for Error {
    fn from(value: AccessError) -> Self {
        match value {
            AccessError::AccessDenied(id) => Error::AccessDenied(id),
            AccessError::Immutable => Error::ImmutableAccess,
            AccessError::Append(err) => err.into(),
        }
    }
}

/// Result type using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
