//! The error taxonomy for repository operations.
//!
//! Variants fall into four families with different propagation policies: format errors
//! (always fatal to the operation), trust errors (fatal to installing the specific object;
//! the previously trusted object remains authoritative), freshness errors (fatal for the
//! current refresh, nothing rolled back), and availability errors (recoverable at the
//! caller's discretion).

use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use snafu::{Backtrace, Snafu};
use std::path::PathBuf;
use url::Url;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this crate.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    /// Two roles declared conflicting file info for the same target path.
    #[snafu(display("Multiple conflicting entries for target '{}'; refusing ambiguous trust", path))]
    AmbiguousTarget { path: String, backtrace: Backtrace },

    #[snafu(display("Failed to initialize datastore: {}", source))]
    DatastoreInit {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DatastoreCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to open '{}' from datastore: {}", path.display(), source))]
    DatastoreOpen {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist '{}' in datastore: {}", path.display(), source.error))]
    DatastorePersist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to remove '{}' from datastore: {}", path.display(), source))]
    DatastoreRemove {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to demote '{}' to '{}': {}", from.display(), to.display(), source))]
    DatastoreRename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to serialize {} for the datastore: {}", what, source))]
    DatastoreSerialize {
        what: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write '{}' in datastore: {}", path.display(), source))]
    DatastoreWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// A delegation chain exceeded the depth limit, or revisited a role. A compromised
    /// parent must not be able to send the resolver into an unbounded walk.
    #[snafu(display("Delegation walk for role '{}' exceeded limit of {}", role, limit))]
    DelegationDepthExceeded {
        role: String,
        limit: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Delegation cycle detected at role '{}'", role))]
    DelegationCycle { role: String, backtrace: Backtrace },

    /// Downloading a file failed on every available mirror.
    #[snafu(display("Failed to download '{}' from {} mirror(s): [{}]", path, attempts.len(), attempts.join("; ")))]
    Download {
        path: String,
        attempts: Vec<String>,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// Metadata past its expiration is not used for decisions in the current refresh.
    /// Already-installed files are retained; only a future successful refresh replaces them.
    #[snafu(display("Metadata for role '{}' expired at {}", role, expires))]
    ExpiredMetadata {
        role: String,
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist temporary file to '{}': {}", path.display(), source.error))]
    FilePersist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create temporary file in '{}': {}", path.display(), source))]
    FileTempCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Hash mismatch for {}: calculated {}, expected {}", context, calculated, expected))]
    HashMismatch {
        context: String,
        calculated: String,
        expected: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid target name '{}': {}", name, reason))]
    InvalidTargetName {
        name: String,
        reason: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to join '{}' to URL '{}': {}", path, url, source))]
    JoinUrl {
        path: String,
        url: Url,
        source: url::ParseError,
        backtrace: Backtrace,
    },

    /// Duplicate key insertion is a caller bug, not a condition to paper over.
    #[snafu(display("Key {} already exists in the trust store", keyid))]
    KeyAlreadyExists { keyid: String, backtrace: Backtrace },

    #[snafu(display("Signing key rejected: {}", source))]
    KeyRejected {
        source: ring::error::KeyRejected,
        backtrace: Backtrace,
    },

    #[snafu(display("Unrecognized or unsupported signing key format"))]
    KeyUnrecognized { backtrace: Backtrace },

    #[snafu(display("Length mismatch for '{}': calculated {}, expected {}", path, calculated, expected))]
    LengthMismatch {
        path: String,
        calculated: u64,
        expected: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("{} exceeded maximum size {} ({})", what, max_size, specifier))]
    MaxSizeExceeded {
        what: String,
        max_size: u64,
        specifier: &'static str,
        backtrace: Backtrace,
    },

    /// A manifest did not list a file it is responsible for describing.
    #[snafu(display("Role '{}' metadata is missing an entry for '{}'", role, file))]
    MetaMissing {
        file: String,
        role: String,
        backtrace: Backtrace,
    },

    /// Metadata for a role is not currently trusted, either because it was never fetched or
    /// because it could not be re-established. Distinct from "present but failed
    /// verification".
    #[snafu(display("No trusted metadata available for role '{}'", role))]
    MetadataNotAvailable { role: String, backtrace: Backtrace },

    /// A delegated role was registered without any of its ancestors being known.
    #[snafu(display("Role '{}' has no registered parent role", name))]
    MissingParentRole { name: String, backtrace: Backtrace },

    /// No configured mirror serves the requested path.
    #[snafu(display("No mirror serves path '{}'", path))]
    NoMatchingMirror { path: String, backtrace: Backtrace },

    #[snafu(display("Failed to parse metadata for role '{}': {}", role, source))]
    ParseMetadata {
        role: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse the trusted root: {}", source))]
    ParseTrustedRoot {
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Role '{}' already exists in the trust store", name))]
    RoleAlreadyExists { name: String, backtrace: Backtrace },

    /// Schema-level failure (parsing, canonical encoding, key decoding).
    #[snafu(context(false))]
    Schema { source: crate::schema::Error },

    #[snafu(display("Failed to sign message: {}", source))]
    Sign {
        source: ring::error::Unspecified,
        backtrace: Backtrace,
    },

    /// The system clock stepped backward past the last sampled time; all freshness
    /// reasoning would be unsound.
    #[snafu(display(
        "System time stepped backward: system time {}, last known time {}",
        sys_time,
        latest_known_time
    ))]
    SystemTimeSteppedBackward {
        sys_time: DateTime<Utc>,
        latest_known_time: DateTime<Utc>,
    },

    #[snafu(display("Requested target '{}' is not described by any trusted role", path))]
    TargetNotFound { path: String, backtrace: Backtrace },

    #[snafu(display("Transport error fetching '{}': {}", url, source))]
    Transport {
        url: Url,
        #[snafu(source(from(TransportError, Box::new)))]
        source: Box<TransportError>,
        backtrace: Backtrace,
    },

    /// A trusted file description names a hash algorithm this client cannot compute, so the
    /// description can never be satisfied.
    #[snafu(display("Unsupported hash algorithm '{}'", algorithm))]
    UnsupportedHashAlgorithm {
        algorithm: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Key {} is not known to the trust store", keyid))]
    UnknownKey { keyid: String, backtrace: Backtrace },

    #[snafu(display("Role '{}' is not known to the trust store", name))]
    UnknownRole { name: String, backtrace: Backtrace },

    /// Signature verification did not meet the role's threshold.
    #[snafu(display(
        "Signature threshold not met for role '{}': {} good signature(s) of {} required",
        role,
        good,
        threshold
    ))]
    VerificationFailed {
        role: String,
        good: usize,
        threshold: u64,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Whether this error is an availability problem (fetch failed, metadata withheld) that
    /// a caller may reasonably retry later, as opposed to a trust or format failure.
    pub fn is_availability(&self) -> bool {
        matches!(
            self,
            Error::Download { .. }
                | Error::MetadataNotAvailable { .. }
                | Error::NoMatchingMirror { .. }
                | Error::Transport { .. }
        )
    }
}
