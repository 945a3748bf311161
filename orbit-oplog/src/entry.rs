//! Log entries, their clocks and the order derived from them.

use std::cmp::Ordering;

use bytes::Bytes;
use ed25519_dalek::Signature;
use orbit_base::{Hash, IdentityId, Signer, SigningError};
use serde::{Deserialize, Serialize};

/// Lamport clock of an entry: a logical time local to a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Writer the time belongs to.
    pub id: IdentityId,
    /// Logical time, one more than the largest time among the entry's predecessors.
    pub time: u64,
}

impl Clock {
    /// Clock for a new entry by `id` whose predecessors carry the given clocks.
    pub fn tick<'a>(id: IdentityId, next: impl IntoIterator<Item = &'a Clock>) -> Self {
        let time = next.into_iter().map(|c| c.time).max().unwrap_or(0) + 1;
        Clock { id, time }
    }
}

/// The unsigned part of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    payload: Bytes,
    clock: Clock,
    next: Vec<Hash>,
    identity: IdentityId,
}

impl Entry {
    /// Create a new entry. `next` is stored as a sorted set.
    pub fn new(payload: Bytes, clock: Clock, next: impl IntoIterator<Item = Hash>) -> Self {
        let mut next: Vec<Hash> = next.into_iter().collect();
        next.sort();
        next.dedup();
        Entry {
            payload,
            identity: clock.id,
            clock,
            next,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Content ids of the immediate causal predecessors. Empty for a root.
    pub fn next(&self) -> &[Hash] {
        &self.next
    }

    /// Public key the entry is signed with.
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    /// Serialize this entry into its canonical byte representation used for signing.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.clock.id.as_bytes());
        out.extend_from_slice(&self.clock.time.to_be_bytes());
        out.extend_from_slice(&(self.next.len() as u64).to_be_bytes());
        for hash in &self.next {
            out.extend_from_slice(hash.as_bytes());
        }
        out.extend_from_slice(self.identity.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.payload);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out);
        out
    }

    /// Sign this entry with `signer`.
    pub fn sign(self, signer: &dyn Signer) -> Result<SignedEntry, SigningError> {
        let signature = signer.sign(&self.to_vec())?;
        Ok(SignedEntry::from_parts(self, signature))
    }
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    entry: Entry,
    signature: Signature,
}

/// A signed entry together with its content id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEntry {
    hash: Hash,
    entry: Entry,
    signature: Signature,
}

/// Reason a blob could not be accepted as an entry.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid encoding: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("content id mismatch")]
    ContentId,
    #[error("next set is not canonical")]
    NonCanonical,
    #[error("clock writer differs from identity")]
    ClockWriter,
    #[error("invalid signature")]
    Signature(#[from] ed25519_dalek::SignatureError),
}

impl SignedEntry {
    fn from_parts(entry: Entry, signature: Signature) -> Self {
        let hash = Hash::new(encode_wire(&entry, &signature));
        SignedEntry {
            hash,
            entry,
            signature,
        }
    }

    /// Decode an entry fetched under `hash` without verifying its signature.
    ///
    /// Fails if the bytes don't hash to `hash` or don't decode.
    pub fn decode(hash: Hash, bytes: &[u8]) -> Result<Self, VerifyError> {
        if Hash::new(bytes) != hash {
            return Err(VerifyError::ContentId);
        }
        let WireEntry { entry, signature } = postcard::from_bytes(bytes)?;
        Ok(SignedEntry {
            hash,
            entry,
            signature,
        })
    }

    /// Check the signature against the entry's identity and the shape of the entry.
    ///
    /// Reachability of the predecessors is not checked.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if !self.entry.next.windows(2).all(|w| w[0] < w[1]) {
            return Err(VerifyError::NonCanonical);
        }
        if self.entry.clock.id != self.entry.identity {
            return Err(VerifyError::ClockWriter);
        }
        self.entry
            .identity
            .verify(&self.entry.to_vec(), &self.signature)?;
        Ok(())
    }

    /// The bytes stored in the content store.
    pub fn encode(&self) -> Vec<u8> {
        encode_wire(&self.entry, &self.signature)
    }

    /// Content id of this entry.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn payload(&self) -> &Bytes {
        self.entry.payload()
    }

    pub fn clock(&self) -> &Clock {
        self.entry.clock()
    }

    pub fn next(&self) -> &[Hash] {
        self.entry.next()
    }

    pub fn identity(&self) -> &IdentityId {
        self.entry.identity()
    }

    /// Position of this entry in the log order.
    pub fn key(&self) -> Key {
        Key {
            time: self.entry.clock.time,
            writer: self.entry.clock.id,
            hash: self.hash,
        }
    }
}

fn encode_wire(entry: &Entry, signature: &Signature) -> Vec<u8> {
    #[derive(Serialize)]
    struct WireRef<'a> {
        entry: &'a Entry,
        signature: &'a Signature,
    }
    // serializing plain structs into a Vec cannot fail
    postcard::to_stdvec(&WireRef { entry, signature }).unwrap_or_default()
}

/// Sort key of an entry.
///
/// Keys sort oldest first: by ascending time, and among equal times the larger writer id first,
/// then the larger content id. Walking the keys backwards therefore yields the newest entry
/// first, with ties going to the smaller writer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub time: u64,
    pub writer: IdentityId,
    pub hash: Hash,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| other.writer.cmp(&self.writer))
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use orbit_base::{Identity, PublicIdentity};
    use rand::SeedableRng;

    use super::*;

    fn identity(seed: u64) -> Identity {
        Identity::new(&mut rand_chacha::ChaCha12Rng::seed_from_u64(seed))
    }

    #[test]
    fn sign_decode_verify() {
        let alice = identity(1);
        let entry = Entry::new(
            Bytes::from_static(b"hello"),
            Clock::tick(alice.id(), []),
            [],
        );
        let signed = entry.sign(&alice).unwrap();
        assert_eq!(signed.clock().time, 1);
        signed.verify().unwrap();

        let bytes = signed.encode();
        assert_eq!(Hash::new(&bytes), signed.hash());
        let decoded = SignedEntry::decode(signed.hash(), &bytes).unwrap();
        decoded.verify().unwrap();
        assert_eq!(decoded, signed);
    }

    #[test]
    fn clock_is_max_of_next_plus_one() {
        let alice = identity(1);
        let clocks = [
            Clock {
                id: alice.id(),
                time: 3,
            },
            Clock {
                id: identity(2).id(),
                time: 7,
            },
        ];
        assert_eq!(Clock::tick(alice.id(), &clocks).time, 8);
    }

    #[test]
    fn tampered_payload_fails() {
        let alice = identity(1);
        let signed = Entry::new(Bytes::from_static(b"a"), Clock::tick(alice.id(), []), [])
            .sign(&alice)
            .unwrap();
        let forged = Entry::new(Bytes::from_static(b"b"), *signed.clock(), []);
        let forged = SignedEntry::from_parts(forged, *signed.signature());
        assert!(matches!(forged.verify(), Err(VerifyError::Signature(_))));
    }

    #[test]
    fn wrong_content_id_fails() {
        let alice = identity(1);
        let signed = Entry::new(Bytes::from_static(b"a"), Clock::tick(alice.id(), []), [])
            .sign(&alice)
            .unwrap();
        let res = SignedEntry::decode(Hash::new(b"other"), &signed.encode());
        assert!(matches!(res, Err(VerifyError::ContentId)));
    }

    #[test]
    fn public_identity_cannot_author() {
        let alice = identity(1);
        let public = PublicIdentity(alice.id());
        let entry = Entry::new(Bytes::new(), Clock::tick(alice.id(), []), []);
        assert!(entry.sign(&public).is_err());
    }

    #[test]
    fn key_order() {
        let a = identity(1).id();
        let b = identity(2).id();
        let (small, large) = if a < b { (a, b) } else { (b, a) };
        let hash = Hash::new(b"x");
        let old = Key {
            time: 1,
            writer: small,
            hash,
        };
        let new_small = Key {
            time: 2,
            writer: small,
            hash,
        };
        let new_large = Key {
            time: 2,
            writer: large,
            hash,
        };
        let mut keys = vec![new_small, old, new_large];
        keys.sort();
        // oldest first, and the smaller writer is the newest among equal times
        assert_eq!(keys, vec![old, new_large, new_small]);
    }
}
