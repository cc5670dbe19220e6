//! Typed representations of the metadata kinds a repository publishes, plus the signed
//! envelope that wraps them.
//!
//! Deserialization is the schema check: a value of one of these types is structurally valid
//! by construction. Unknown fields are collected into `_extra` maps so that re-serializing a
//! parsed payload reproduces the exact bytes its signatures were computed over.

mod de;
pub mod decoded;
mod error;
mod iter;
pub mod key;
mod spki;

use crate::schema::decoded::{Decoded, Hex};
pub use crate::schema::error::{Error, Result};
use crate::schema::iter::KeysIter;
use crate::schema::key::{Key, SignatureMethod};
use chrono::{DateTime, Utc};
use globset::Glob;
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, Context, SHA256, SHA512};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::num::NonZeroU64;
use std::path::Path;

/// The relative path of root metadata within a repository.
pub const ROOT_FILENAME: &str = "root.txt";
/// The relative path of timestamp metadata within a repository.
pub const TIMESTAMP_FILENAME: &str = "timestamp.txt";
/// The relative path of release metadata within a repository.
pub const RELEASE_FILENAME: &str = "release.txt";
/// The relative path of top-level targets metadata within a repository.
pub const TARGETS_FILENAME: &str = "targets.txt";

/// Returns the relative path of the metadata file for a role. Delegated roles use their full
/// hierarchical name as the file stem, e.g. `targets/plugins` -> `targets/plugins.txt`.
pub fn metadata_filename(role_name: &str) -> String {
    format!("{role_name}.txt")
}

/// The kind of metadata role.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    /// The root role declares the keys and thresholds for every top-level role, including
    /// itself. It is the sole source of initial trust.
    Root,
    /// The timestamp role points at the current release metadata, and is the single small
    /// file re-fetched on every refresh to detect change cheaply.
    Timestamp,
    /// The release role signs a manifest of the expected length and hashes of every other
    /// metadata file.
    Release,
    /// The targets role (and its delegates) declare which target files are trusted.
    Targets,
    /// The mirrors role lists where repository content can be fetched from. Configuration,
    /// not trust-bearing.
    Mirrors,
}

forward_display_to_serde!(RoleType);
forward_from_str_to_serde!(RoleType);

impl RoleType {
    /// The role name used in key databases and file stems.
    pub fn name(self) -> &'static str {
        match self {
            RoleType::Root => "root",
            RoleType::Timestamp => "timestamp",
            RoleType::Release => "release",
            RoleType::Targets => "targets",
            RoleType::Mirrors => "mirrors",
        }
    }
}

/// Common trait implemented by all metadata payloads.
pub trait Role: Serialize {
    /// The type of role this object represents.
    const TYPE: RoleType;

    /// When this metadata was issued.
    fn issued(&self) -> DateTime<Utc>;

    /// When this metadata should be considered expired and no longer trusted.
    fn expires(&self) -> DateTime<Utc>;

    /// The deterministic serialization that signatures are computed over and verified
    /// against. Object keys are sorted, floats are rejected, and there is exactly one
    /// encoding per logical value.
    fn canonical_form(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu { what: "role" })?;
        Ok(data)
    }
}

/// A signed metadata object.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role that is signed.
    pub signed: T,
    /// A list of signatures and their key IDs.
    pub signatures: Vec<Signature>,
}

/// A signature, the key ID that made it, and the method used.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// The ID of the key that made this signature.
    pub keyid: Decoded<Hex>,
    /// The signing algorithm used.
    pub method: SignatureMethod,
    /// The signature over the canonical form of the role.
    pub sig: Decoded<Hex>,
}

impl<T> Signed<T> {
    /// Adds a signature, replacing any existing signature by the same key. At most one
    /// signature per key ID is ever retained.
    pub fn add_signature(&mut self, signature: Signature) {
        self.signatures.retain(|s| s.keyid != signature.keyid);
        self.signatures.push(signature);
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Root metadata: the keys and role assignments everything else derives trust from.
/// Bootstrapped out of band and the only metadata ever trusted by file presence.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "root")]
pub struct Root {
    /// When this metadata was issued.
    pub ts: DateTime<Utc>,

    /// When this metadata expires.
    pub expires: DateTime<Utc>,

    /// All public keys known to the repository, indexed by key ID. Each key ID is verified
    /// against the key's canonical digest during deserialization.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// Role name to authorization record. Top-level role names are `root`, `timestamp`,
    /// `release`, `targets`, and optionally `mirrors`.
    pub roles: HashMap<String, RoleKeys>,

    /// Extra arguments found during deserialization, stored to correctly verify signatures
    /// for this object.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// The key IDs authorized to sign for a role, the signature threshold, and (for
/// target-bearing roles) the path patterns the role may assert information about.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    /// The key IDs used for the role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The minimum number of distinct good, authorized signatures required.
    pub threshold: NonZeroU64,

    /// Patterns restricting which target paths this role, and everything it delegates to,
    /// may declare. `None` means unrestricted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathPattern>>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Root {
    /// An iterator over the keys authorized for a named role.
    pub fn keys(&self, role_name: &str) -> impl Iterator<Item = &Key> {
        KeysIter {
            keyids_iter: match self.roles.get(role_name) {
                Some(role_keys) => role_keys.keyids.iter(),
                None => [].iter(),
            },
            keys: &self.keys,
        }
    }

    /// Returns the key ID under which `key` is registered, if any.
    pub fn key_id(&self, key: &Key) -> Option<Decoded<Hex>> {
        for (key_id, candidate) in &self.keys {
            if candidate == key {
                return Some(key_id.clone());
            }
        }
        None
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn issued(&self) -> DateTime<Utc> {
        self.ts
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A path pattern with shell-style wildcards, e.g. `plugins/*` or `v?/**/*.tar.gz`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct PathPattern(String);

impl PathPattern {
    /// Creates a pattern from a string. The pattern is not validated here; a pattern that
    /// fails to compile matches nothing.
    pub fn new<S: Into<String>>(pattern: S) -> Self {
        Self(pattern.into())
    }

    /// Whether `target` matches this pattern.
    pub fn matches(&self, target: &str) -> bool {
        let glob = if let Ok(glob) = Glob::new(&self.0) {
            glob.compile_matcher()
        } else {
            return false;
        };
        glob.is_match(target)
    }

    /// The pattern text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether `target` matches at least one of `patterns`.
pub fn any_pattern_matches(patterns: &[PathPattern], target: &str) -> bool {
    patterns.iter().any(|p| p.matches(target))
}

/// A hash algorithm named in a [`FileInfo`]. Unknown algorithms parse so that a client can
/// report them rather than choke on the file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
    /// An algorithm this client does not implement.
    #[serde(untagged)]
    Unknown(String),
}

forward_display_to_serde!(HashAlgorithm);

impl HashAlgorithm {
    /// Digests `bytes` with this algorithm, or `None` if the algorithm is unsupported.
    pub fn digest(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        match self {
            HashAlgorithm::Sha256 => Some(digest(&SHA256, bytes).as_ref().to_vec()),
            HashAlgorithm::Sha512 => Some(digest(&SHA512, bytes).as_ref().to_vec()),
            HashAlgorithm::Unknown(_) => None,
        }
    }
}

/// The length and hashes of a file, used identically to describe metadata files (in
/// manifests) and target files.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FileInfo {
    /// The length of the file in bytes.
    pub length: u64,

    /// One or more hashes of the file contents, keyed by algorithm.
    pub hashes: HashMap<HashAlgorithm, Decoded<Hex>>,

    /// Opaque application data carried alongside target entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom: Option<HashMap<String, Value>>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl FileInfo {
    /// Describes `bytes` with a SHA-256 hash and exact length.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hashes = HashMap::new();
        hashes.insert(
            HashAlgorithm::Sha256,
            digest(&SHA256, bytes).as_ref().to_vec().into(),
        );
        Self {
            length: bytes.len() as u64,
            hashes,
            custom: None,
            _extra: HashMap::new(),
        }
    }

    /// Describes the file at `path`, streaming it through SHA-256.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return error::TargetNotAFileSnafu { path }.fail();
        }

        let mut file = File::open(path).context(error::FileOpenSnafu { path })?;
        let mut context = Context::new(&SHA256);
        let mut buf = [0; 8 * 1024];
        let mut length = 0;
        loop {
            match file.read(&mut buf).context(error::FileReadSnafu { path })? {
                0 => break,
                n => {
                    context.update(&buf[..n]);
                    length += n as u64;
                }
            }
        }

        let mut hashes = HashMap::new();
        hashes.insert(
            HashAlgorithm::Sha256,
            context.finish().as_ref().to_vec().into(),
        );
        Ok(Self {
            length,
            hashes,
            custom: None,
            _extra: HashMap::new(),
        })
    }

    /// The SHA-256 digest, if one is present.
    pub fn sha256(&self) -> Option<&Decoded<Hex>> {
        self.hashes.get(&HashAlgorithm::Sha256)
    }

    /// Whether a file described by `self` differs from one described by `cached`: the
    /// lengths disagree, or any hash algorithm known to both disagrees. Two descriptions
    /// sharing no algorithm are treated as differing, so "no reference info" always means
    /// "re-check".
    pub fn differs_from(&self, cached: &FileInfo) -> bool {
        if self.length != cached.length {
            return true;
        }
        let mut shared = 0;
        for (algorithm, digest) in &self.hashes {
            if let Some(other) = cached.hashes.get(algorithm) {
                shared += 1;
                if digest != other {
                    return true;
                }
            }
        }
        shared == 0
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Timestamp metadata: points only at the current release file's [`FileInfo`]. Re-fetched
/// on every refresh; the root of the freshness chain.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "timestamp")]
pub struct Timestamp {
    /// When this metadata was issued.
    pub ts: DateTime<Utc>,

    /// When this metadata expires.
    pub expires: DateTime<Utc>,

    /// Metadata file path to expected file info. Contains only the release file.
    pub meta: HashMap<String, FileInfo>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Timestamp {
    /// The expected file info for the release file, if listed.
    pub fn release_info(&self) -> Option<&FileInfo> {
        self.meta.get(RELEASE_FILENAME)
    }
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn issued(&self) -> DateTime<Utc> {
        self.ts
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Release metadata: a manifest of the expected length and hashes of every other metadata
/// file in the repository.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "release")]
pub struct Release {
    /// When this metadata was issued.
    pub ts: DateTime<Utc>,

    /// When this metadata expires.
    pub expires: DateTime<Utc>,

    /// Metadata file path (e.g. `targets.txt`, `targets/plugins.txt`) to expected file info.
    pub meta: HashMap<String, FileInfo>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Role for Release {
    const TYPE: RoleType = RoleType::Release;

    fn issued(&self) -> DateTime<Utc> {
        self.ts
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Targets metadata: the target files a role vouches for, and the sub-roles it delegates
/// restricted subsets of the target namespace to. Used for the top-level `targets` role and
/// for every delegated role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "targets")]
pub struct Targets {
    /// When this metadata was issued.
    pub ts: DateTime<Utc>,

    /// When this metadata expires.
    pub expires: DateTime<Utc>,

    /// Target relative path to file info.
    pub targets: HashMap<String, FileInfo>,

    /// Sub-roles this role delegates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn issued(&self) -> DateTime<Utc> {
        self.ts
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

/// The delegations block of a targets file: the keys delegated roles sign with, and the
/// roles themselves.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct Delegations {
    /// Public keys for verifying delegated role signatures, indexed by key ID.
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: HashMap<Decoded<Hex>, Key>,

    /// The delegated roles.
    pub roles: Vec<DelegatedRole>,
}

impl Delegations {
    /// Creates an empty delegations block.
    pub fn new() -> Self {
        Self::default()
    }
}

/// One delegated role entry inside a [`Delegations`] block.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DelegatedRole {
    /// The full hierarchical name of the delegated role, e.g. `targets/plugins`.
    pub name: String,

    /// The key IDs used by this role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: NonZeroU64,

    /// The target paths this role is trusted for. Stored as declared; containment within
    /// ancestor patterns is enforced when targets are accepted, not at import.
    pub paths: Vec<PathPattern>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl DelegatedRole {
    /// Returns this role's authorization record for registration in a key database.
    pub fn role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keyids.clone(),
            threshold: self.threshold,
            paths: Some(self.paths.clone()),
            _extra: HashMap::new(),
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Mirrors metadata: where repository content may be fetched from. This is configuration,
/// not trust-bearing; a hostile mirror can at worst withhold files.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "mirrors")]
pub struct Mirrors {
    /// When this metadata was issued.
    pub ts: DateTime<Utc>,

    /// When this metadata expires.
    pub expires: DateTime<Utc>,

    /// The mirror descriptors.
    pub mirrors: Vec<MirrorMeta>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// One mirror descriptor.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MirrorMeta {
    /// The base URL files are fetched relative to.
    pub urlbase: String,

    /// The relative paths this mirror serves.
    pub paths: Vec<PathPattern>,

    /// Extra arguments found during deserialization.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Role for Mirrors {
    const TYPE: RoleType = RoleType::Mirrors;

    fn issued(&self) -> DateTime<Utc> {
        self.ts
    }

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_targets_json() -> serde_json::Value {
        serde_json::json!({
            "signed": {
                "_type": "targets",
                "ts": "2026-01-02T03:04:05Z",
                "expires": "2027-01-02T03:04:05Z",
                "targets": {
                    "plugins/a.so": {
                        "length": 3,
                        "hashes": {
                            "sha256": "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
                        }
                    }
                },
                "delegations": {
                    "keys": {},
                    "roles": [{
                        "name": "targets/plugins",
                        "keyids": [],
                        "threshold": 1,
                        "paths": ["plugins/*"]
                    }]
                }
            },
            "signatures": []
        })
    }

    #[test]
    fn canonical_encoding_is_idempotent() {
        let signed: Signed<Targets> = serde_json::from_value(sample_targets_json()).unwrap();
        let first = signed.signed.canonical_form().unwrap();
        let reparsed: Targets = serde_json::from_slice(&first).unwrap();
        assert_eq!(reparsed.canonical_form().unwrap(), first);
    }

    #[test]
    fn unknown_fields_survive_round_trip() {
        let mut value = sample_targets_json();
        value["signed"]["frobnicate"] = serde_json::json!("keep me");
        let signed: Signed<Targets> = serde_json::from_value(value).unwrap();
        let encoded = signed.signed.canonical_form().unwrap();
        assert!(String::from_utf8(encoded).unwrap().contains("frobnicate"));
    }

    #[test]
    fn path_pattern_matching() {
        let pattern = PathPattern::new("plugins/*");
        assert!(pattern.matches("plugins/a.so"));
        assert!(!pattern.matches("core/b.so"));

        let deep = PathPattern::new("v?/**/*.tar.gz");
        assert!(deep.matches("v1/x/y/z.tar.gz"));
        assert!(!deep.matches("v10/x.tar.gz"));
    }

    #[test]
    fn fileinfo_change_detection() {
        let a = FileInfo::from_bytes(b"abc");
        let same = FileInfo::from_bytes(b"abc");
        let different = FileInfo::from_bytes(b"abd");
        assert!(!a.differs_from(&same));
        assert!(a.differs_from(&different));

        // Same length, no shared algorithms: must re-check.
        let mut sha512_only = FileInfo::from_bytes(b"abc");
        let digest = HashAlgorithm::Sha512.digest(b"abc").unwrap();
        sha512_only.hashes.clear();
        sha512_only
            .hashes
            .insert(HashAlgorithm::Sha512, digest.into());
        assert!(a.differs_from(&sha512_only));
    }

    #[test]
    fn resigning_replaces_existing_signature() {
        let mut signed: Signed<Targets> = serde_json::from_value(sample_targets_json()).unwrap();
        let keyid: Decoded<Hex> = vec![1u8; 32].into();
        signed.add_signature(Signature {
            keyid: keyid.clone(),
            method: SignatureMethod::Ed25519,
            sig: vec![2u8; 64].into(),
        });
        signed.add_signature(Signature {
            keyid,
            method: SignatureMethod::Ed25519,
            sig: vec![3u8; 64].into(),
        });
        assert_eq!(signed.signatures.len(), 1);
        assert_eq!(signed.signatures[0].sig, vec![3u8; 64]);
    }

    #[test]
    fn mirrors_parse() {
        let mirrors: Signed<Mirrors> = serde_json::from_value(serde_json::json!({
            "signed": {
                "_type": "mirrors",
                "ts": "2026-01-02T03:04:05Z",
                "expires": "2027-01-02T03:04:05Z",
                "mirrors": [
                    { "urlbase": "https://mirror.example.com/repo/", "paths": ["**"] }
                ]
            },
            "signatures": []
        }))
        .unwrap();
        assert_eq!(mirrors.signed.mirrors.len(), 1);
        assert!(mirrors.signed.mirrors[0].paths[0].matches("meta/root.txt"));
    }
}
