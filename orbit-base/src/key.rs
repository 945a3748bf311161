//! Signing identities used to author and verify log entries.

use std::{cmp::Ordering, fmt, str::FromStr};

use ed25519_dalek::{Signature, SignatureError, Signer as _, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use crate::base32;

/// A signing capability.
///
/// Entries are authored through this trait so that identities whose secret key lives elsewhere
/// (or is not available at all) can still be used to open databases read-only.
pub trait Signer: fmt::Debug + Send + Sync + 'static {
    /// The public identifier entries will be signed as.
    fn id(&self) -> IdentityId;

    /// Sign `msg`, or fail if this identity cannot produce signatures.
    fn sign(&self, msg: &[u8]) -> Result<Signature, SigningError>;
}

/// Error returned when an identity cannot sign.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// The identity only holds a public key.
    #[error("identity {0} has no signing key")]
    NoSigningKey(IdentityId),
}

/// A writer identity holding an ed25519 [`SigningKey`].
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Create a new [`Identity`] with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Identity { signing_key }
    }

    /// Create an [`Identity`] from a byte array.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// Returns the secret key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the [`PublicKey`] for this identity.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Get the [`IdentityId`] for this identity.
    pub fn id(&self) -> IdentityId {
        IdentityId::from(self.public_key())
    }
}

impl Signer for Identity {
    fn id(&self) -> IdentityId {
        Identity::id(self)
    }

    fn sign(&self, msg: &[u8]) -> Result<Signature, SigningError> {
        Ok(self.signing_key.sign(msg))
    }
}

/// An identity of which only the public half is known.
///
/// Can be used to open and read databases; every attempt to author an entry fails with
/// [`SigningError::NoSigningKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity(pub IdentityId);

impl Signer for PublicIdentity {
    fn id(&self) -> IdentityId {
        self.0
    }

    fn sign(&self, _msg: &[u8]) -> Result<Signature, SigningError> {
        Err(SigningError::NoSigningKey(self.0))
    }
}

/// Verifying half of an [`Identity`].
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, derive_more::From)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Strictly verify that `signature` over `msg` was created by this key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify_strict(msg, signature)
    }

    /// Get the byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create from a slice of bytes.
    ///
    /// Fails if the bytes are not a valid ed25519 curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        Ok(PublicKey(VerifyingKey::from_bytes(bytes)?))
    }

    /// Short base32 form for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(&self.as_bytes()[..5])
    }
}

/// [`PublicKey`] in bytes. This is the writer id entries are ordered and authorized by.
#[derive(
    Default,
    Clone,
    Copy,
    PartialOrd,
    Ord,
    Eq,
    PartialEq,
    Hash,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
)]
pub struct IdentityId([u8; 32]);

impl IdentityId {
    /// Convert to byte array.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Convert to byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert into a [`PublicKey`].
    ///
    /// Fails if the bytes of this [`IdentityId`] are not a valid ed25519 curve point.
    pub fn public_key(&self) -> Result<PublicKey, SignatureError> {
        PublicKey::from_bytes(&self.0)
    }

    /// Verify `signature` over `msg` against this id.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.public_key()?.verify(msg, signature)
    }

    /// Short base32 form for logging.
    pub fn fmt_short(&self) -> String {
        base32::fmt_short(&self.0[..5])
    }
}

impl Serialize for IdentityId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for IdentityId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <[u8; 32]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

impl From<PublicKey> for IdentityId {
    fn from(value: PublicKey) -> Self {
        Self(*value.as_bytes())
    }
}

impl From<&Identity> for IdentityId {
    fn from(value: &Identity) -> Self {
        value.id()
    }
}

impl From<SigningKey> for Identity {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.id().fmt_short())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", self.fmt_short())
    }
}

/// Error when parsing keys and ids from strings.
#[derive(Debug, thiserror::Error)]
pub enum KeyParsingError {
    /// Not valid base32.
    #[error("invalid base32: {0}")]
    Base32(#[from] base32::DecodeError),
    /// Not a valid curve point.
    #[error("invalid key: {0}")]
    Key(#[from] SignatureError),
}

impl FromStr for Identity {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?))
    }
}

impl FromStr for PublicKey {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?)?)
    }
}

impl FromStr for IdentityId {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PublicKey::from_str(s).map(|x| x.into())
    }
}
