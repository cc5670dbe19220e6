//! Provides [`Decoded`], a wrapper around byte strings that remembers the textual encoding
//! they arrived in. Metadata stores key material and digests as encoded strings; signatures
//! are checked against the decoded bytes, while re-serialization must reproduce the original
//! text exactly so that signed bytes round-trip.

use crate::schema::error::{self, Result};
use pem::Pem;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;

/// A textual encoding for a byte string.
pub trait Encode {
    /// Encodes bytes as a string.
    fn encode(b: &[u8]) -> String;
}

/// The inverse of [`Encode`].
pub trait Decode {
    /// Decodes a string into bytes.
    fn decode(s: &str) -> Result<Vec<u8>>;
}

/// Lowercase hexadecimal encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex;

impl Encode for Hex {
    fn encode(b: &[u8]) -> String {
        hex::encode(b)
    }
}

impl Decode for Hex {
    fn decode(s: &str) -> Result<Vec<u8>> {
        hex::decode(s).context(error::HexDecodeSnafu { value: s })
    }
}

/// PEM encoding, used for RSA public key material. The decoded form is the DER contents of
/// the PEM block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsaPem;

impl Encode for RsaPem {
    fn encode(b: &[u8]) -> String {
        pem::encode(&Pem::new("PUBLIC KEY", b.to_vec()))
    }
}

impl Decode for RsaPem {
    fn decode(s: &str) -> Result<Vec<u8>> {
        Ok(pem::parse(s)
            .context(error::PemDecodeSnafu)?
            .contents()
            .to_vec())
    }
}

/// A byte string along with the exact text it was decoded from. Equality, ordering, and
/// hashing consider only the decoded bytes.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    bytes: Vec<u8>,
    original: String,
    spooky: PhantomData<T>,
}

impl<T> Decoded<T> {
    /// Consumes this object and returns the decoded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl<T: Encode> From<Vec<u8>> for Decoded<T> {
    fn from(bytes: Vec<u8>) -> Self {
        let original = T::encode(&bytes);
        Self {
            bytes,
            original,
            spooky: PhantomData,
        }
    }
}

impl<T> fmt::Display for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl<T> Deref for Decoded<T> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> AsRef<[u8]> for Decoded<T> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T> PartialEq for Decoded<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> PartialEq<[u8]> for Decoded<T> {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes == other
    }
}

impl<T> PartialEq<Vec<u8>> for Decoded<T> {
    fn eq(&self, other: &Vec<u8>) -> bool {
        &self.bytes == other
    }
}

impl<T> Eq for Decoded<T> {}

impl<T> Hash for Decoded<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<T> PartialOrd for Decoded<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Decoded<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl<'de, T: Decode> Deserialize<'de> for Decoded<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let original = String::deserialize(deserializer)?;
        let bytes = T::decode(&original).map_err(D::Error::custom)?;
        Ok(Self {
            bytes,
            original,
            spooky: PhantomData,
        })
    }
}

impl<T> Serialize for Decoded<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}
