//! Errors that can occur while parsing, encoding, or hashing metadata.

use snafu::Snafu;
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for metadata schema operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// A duplicate key ID was present in a key map.
    #[snafu(display("Duplicate key ID: {}", keyid))]
    DuplicateKeyId {
        /// The duplicated key ID.
        keyid: String,
    },

    /// Failed to open a file.
    #[snafu(display("Failed to open '{}': {}", path.display(), source))]
    FileOpen {
        /// The file that could not be opened.
        path: PathBuf,
        /// The source error.
        source: std::io::Error,
    },

    /// Failed to read a file.
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        /// The file that could not be read.
        path: PathBuf,
        /// The source error.
        source: std::io::Error,
    },

    /// A hex-encoded string could not be decoded.
    #[snafu(display("Invalid hex string '{}': {}", value, source))]
    HexDecode {
        /// The string that could not be decoded.
        value: String,
        /// The source error.
        source: hex::FromHexError,
    },

    /// A key ID did not match the digest of its key's canonical encoding.
    #[snafu(display("Invalid key ID {}: calculated {}", keyid, calculated))]
    InvalidKeyId {
        /// The key ID as declared.
        keyid: String,
        /// The key ID derived from the key itself.
        calculated: String,
    },

    /// A DER-encoded public key was structurally invalid.
    #[snafu(display("Invalid public key encoding: {}", reason))]
    InvalidPublicKey {
        /// Why the key was rejected.
        reason: &'static str,
    },

    /// Serialization through the canonical JSON formatter failed. This indicates an
    /// unrepresentable value (such as a float) and is not recoverable.
    #[snafu(display("Failed to serialize {} to JSON: {}", what, source))]
    JsonSerialization {
        /// What was being serialized.
        what: String,
        /// The source error.
        source: serde_json::Error,
    },

    /// A PEM-encoded value could not be parsed.
    #[snafu(display("Invalid PEM string: {}", source))]
    PemDecode {
        /// The source error.
        source: pem::PemError,
    },

    /// A target path referred to something other than a regular file.
    #[snafu(display("Target not a file: '{}'", path.display()))]
    TargetNotAFile {
        /// The offending path.
        path: PathBuf,
    },
}
