//! The blake3 content identifier used for entries, manifests and blobs.

use std::{fmt, str::FromStr};

use serde::{
    de::{self, SeqAccess},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Content identifier: the blake3 hash of an immutable blob.
#[derive(PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash(blake3::Hash);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&DD(self.fmt_short())).finish()
    }
}

struct DD<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DD<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Hash {
    /// The hash for the empty byte range (`b""`).
    pub const EMPTY: Hash = Hash::from_bytes([
        175, 19, 73, 185, 245, 249, 161, 166, 160, 64, 77, 234, 54, 220, 201, 73, 155, 203, 37,
        201, 173, 193, 18, 183, 204, 154, 147, 202, 228, 31, 50, 98,
    ]);

    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Hash(blake3::hash(buf.as_ref()))
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(blake3::Hash::from_bytes(bytes))
    }

    /// Convert the hash to a hex string.
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    /// Short base32 form of the first 5 bytes, for logging.
    pub fn fmt_short(&self) -> String {
        crate::base32::fmt_short(&self.as_bytes()[..5])
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<blake3::Hash> for Hash {
    fn from(value: blake3::Hash) -> Self {
        Hash(value)
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Hash(blake3::Hash::from(value))
    }
}

impl From<Hash> for [u8; 32] {
    fn from(value: Hash) -> Self {
        *value.as_bytes()
    }
}

impl PartialOrd for Hash {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Hash {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // result will be 52 bytes
        let mut res = [b'b'; 52];
        data_encoding::BASE32_NOPAD.encode_mut(self.as_bytes(), &mut res);
        // base32 output is always ascii
        let t = std::str::from_utf8_mut(res.as_mut()).map_err(|_| fmt::Error)?;
        t.make_ascii_lowercase();
        f.write_str(t)
    }
}

/// Error when parsing a [`Hash`] from a string.
#[derive(Debug, thiserror::Error)]
pub enum HashParseError {
    /// Neither 64 hex chars nor 52 base32 chars.
    #[error("invalid hash length {0}")]
    Length(usize),
    /// Not valid base32.
    #[error("invalid base32: {0}")]
    Base32(#[from] data_encoding::DecodeError),
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sb = s.as_bytes();
        if sb.len() == 64 {
            let mut bytes = [0u8; 32];
            if hex::decode_to_slice(sb, &mut bytes).is_ok() {
                return Ok(Self::from(bytes));
            }
        }
        if sb.len() != 52 {
            return Err(HashParseError::Length(sb.len()));
        }
        let bytes = crate::base32::parse_array::<32>(s)?;
        Ok(Self::from(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            // Fixed-length structures, including arrays, are supported in Serde as tuples
            let mut s = serializer.serialize_tuple(32)?;
            for item in self.0.as_bytes() {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, HashVisitor)
        }
    }
}

struct HashVisitor;

impl<'de> de::Visitor<'de> for HashVisitor {
    type Value = Hash;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "an array of 32 bytes containing hash data")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut arr = [0u8; 32];
        for (i, byte) in arr.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Hash::from(arr))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn hash_text_roundtrip(bytes in any::<[u8; 32]>()) {
            let hash = Hash::from(bytes);
            let base32 = hash.to_string();
            prop_assert_eq!(base32.len(), 52);
            prop_assert_eq!(base32.parse::<Hash>().unwrap(), hash);
            prop_assert_eq!(hash.to_hex().parse::<Hash>().unwrap(), hash);
        }
    }

    #[test]
    fn test_display_parse_roundtrip() {
        for i in 0..100 {
            let hash: Hash = blake3::hash(&[i]).into();
            let text = hash.to_string();
            assert_eq!(text.len(), 52);
            let hash1 = text.parse::<Hash>().unwrap();
            assert_eq!(hash, hash1);

            let text = hash.to_hex();
            let hash1 = Hash::from_str(&text).unwrap();
            assert_eq!(hash, hash1);
        }
    }

    #[test]
    fn test_empty_hash() {
        assert_eq!(Hash::new(b""), Hash::EMPTY);
    }

    #[test]
    fn test_bad_length() {
        assert!(matches!(
            "abc".parse::<Hash>(),
            Err(HashParseError::Length(3))
        ));
    }

    #[test]
    fn test_hash_postcard() {
        let hash = Hash::new("hello");
        let ser = postcard::to_stdvec(&hash).unwrap();
        assert_eq!(ser.len(), 32);
        let de: Hash = postcard::from_bytes(&ser).unwrap();
        assert_eq!(hash, de);
    }

    #[test]
    fn test_hash_json() {
        let hash = Hash::new("hello");
        let ser = serde_json::to_string(&hash).unwrap();
        assert_eq!(
            ser,
            "\"5khrmpntq2bjexseshc6ldklwnig56gbj23yvbxjbdcwestheahq\""
        );
        let de: Hash = serde_json::from_str(&ser).unwrap();
        assert_eq!(hash, de);
    }
}
