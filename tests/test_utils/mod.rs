//! Builds complete signed repositories in temporary directories for integration tests.

use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::Ed25519KeyPair;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::path::Path;
use tempfile::TempDir;
use updraft::schema::decoded::{Decoded, Hex};
use updraft::schema::key::Key;
use updraft::schema::{
    metadata_filename, DelegatedRole, Delegations, FileInfo, PathPattern, Release, Role,
    RoleKeys, Root, Signature, Signed, Targets, Timestamp, RELEASE_FILENAME, ROOT_FILENAME,
    TARGETS_FILENAME, TIMESTAMP_FILENAME,
};
use updraft::sign::{parse_keypair, Sign};
use updraft::{
    ExpirationEnforcement, FilesystemTransport, Limits, Mirror, Repository, Result, Settings,
};
use url::Url;

pub struct RoleKey {
    pub keyid: Decoded<Hex>,
    pub key: Key,
    signer: Box<dyn Sign>,
}

pub fn generate_key() -> RoleKey {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
    let signer = parse_keypair(pkcs8.as_ref()).unwrap();
    let key = signer.public_key();
    let keyid = key.key_id().unwrap();
    RoleKey {
        keyid,
        key,
        signer,
    }
}

fn sign_role_with<T: Role>(role: T, keys: &[&RoleKey]) -> Vec<u8> {
    let canonical = role.canonical_form().unwrap();
    let rng = SystemRandom::new();
    let mut signed = Signed {
        signed: role,
        signatures: Vec::new(),
    };
    for key in keys {
        let sig = key.signer.sign(&canonical, &rng).unwrap();
        signed.add_signature(Signature {
            keyid: key.keyid.clone(),
            method: key.signer.method(),
            sig: sig.into(),
        });
    }
    serde_json::to_vec(&signed).unwrap()
}

fn sign_role<T: Role>(role: T, key: &RoleKey) -> Vec<u8> {
    sign_role_with(role, &[key])
}

fn role_keys(key: &RoleKey) -> RoleKeys {
    RoleKeys {
        keyids: vec![key.keyid.clone()],
        threshold: NonZeroU64::new(1).unwrap(),
        paths: None,
        _extra: HashMap::new(),
    }
}

fn build_root(
    root_key: &RoleKey,
    timestamp_key: &RoleKey,
    release_key: &RoleKey,
    targets_key: &RoleKey,
    issued: DateTime<Utc>,
    expires: DateTime<Utc>,
) -> Root {
    let mut keys = HashMap::new();
    let mut roles = HashMap::new();
    for (name, key) in [
        ("root", root_key),
        ("timestamp", timestamp_key),
        ("release", release_key),
        ("targets", targets_key),
    ] {
        keys.insert(key.keyid.clone(), key.key.clone());
        roles.insert(name.to_owned(), role_keys(key));
    }
    Root {
        ts: issued,
        expires,
        keys,
        roles,
        _extra: HashMap::new(),
    }
}

fn write(dir: &Path, rel: &str, bytes: &[u8]) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

/// One delegated role in the repository under construction.
pub struct DelegatedSpec {
    name: String,
    paths: Vec<String>,
    entries: Vec<(String, Vec<u8>)>,
    listed_in_release: bool,
}

impl DelegatedSpec {
    pub fn new(name: &str, paths: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            paths: paths.iter().map(|p| (*p).to_owned()).collect(),
            entries: Vec::new(),
            listed_in_release: true,
        }
    }

    /// Declares (and writes) a target file for this role.
    pub fn entry(mut self, path: &str, bytes: &[u8]) -> Self {
        self.entries.push((path.to_owned(), bytes.to_vec()));
        self
    }

    /// Leaves this role's metadata out of the release manifest, making it unavailable to
    /// clients even though the parent delegates to it.
    pub fn omit_from_release(mut self) -> Self {
        self.listed_in_release = false;
        self
    }
}

pub struct RepoBuilder {
    targets: Vec<(String, Vec<u8>)>,
    delegated: Vec<DelegatedSpec>,
    expired_timestamp: bool,
    targets_signed_with_timestamp_key: bool,
    content_expires_in: Option<Duration>,
}

impl RepoBuilder {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            delegated: Vec::new(),
            expired_timestamp: false,
            targets_signed_with_timestamp_key: false,
            content_expires_in: None,
        }
    }

    pub fn target(mut self, path: &str, bytes: &[u8]) -> Self {
        self.targets.push((path.to_owned(), bytes.to_vec()));
        self
    }

    pub fn delegated(mut self, spec: DelegatedSpec) -> Self {
        self.delegated.push(spec);
        self
    }

    pub fn expired_timestamp(mut self) -> Self {
        self.expired_timestamp = true;
        self
    }

    /// Signs top-level targets metadata with the timestamp role's key: a known key, but one
    /// the targets role does not authorize.
    pub fn sign_targets_with_timestamp_key(mut self) -> Self {
        self.targets_signed_with_timestamp_key = true;
        self
    }

    /// Gives the release and targets metadata a short lifetime while the timestamp and root
    /// stay long-lived.
    pub fn release_and_targets_expire_in(mut self, lifetime: Duration) -> Self {
        self.content_expires_in = Some(lifetime);
        self
    }

    pub fn build(self) -> BuiltRepo {
        let dir = tempfile::tempdir().unwrap();
        let issued = Utc::now() - Duration::hours(1);
        let expires = Utc::now() + Duration::days(365);
        let content_expires = self
            .content_expires_in
            .map_or(expires, |lifetime| Utc::now() + lifetime);

        let root_key = generate_key();
        let timestamp_key = generate_key();
        let release_key = generate_key();
        let targets_key = generate_key();

        // Delegated roles first; the top-level targets metadata references their keys.
        let mut delegation_keys = HashMap::new();
        let mut delegation_roles = Vec::new();
        let mut release_meta = HashMap::new();
        for spec in &self.delegated {
            let key = generate_key();
            let mut target_map = HashMap::new();
            for (path, bytes) in &spec.entries {
                target_map.insert(path.clone(), FileInfo::from_bytes(bytes));
                write(dir.path(), &format!("targets/{path}"), bytes);
            }
            let bytes = sign_role(
                Targets {
                    ts: issued,
                    expires,
                    targets: target_map,
                    delegations: None,
                    _extra: HashMap::new(),
                },
                &key,
            );
            let filename = metadata_filename(&spec.name);
            write(dir.path(), &format!("meta/{filename}"), &bytes);
            if spec.listed_in_release {
                release_meta.insert(filename, FileInfo::from_bytes(&bytes));
            }

            delegation_keys.insert(key.keyid.clone(), key.key.clone());
            delegation_roles.push(DelegatedRole {
                name: spec.name.clone(),
                keyids: vec![key.keyid.clone()],
                threshold: NonZeroU64::new(1).unwrap(),
                paths: spec.paths.iter().map(|p| PathPattern::new(p.as_str())).collect(),
                _extra: HashMap::new(),
            });
        }

        let mut target_map = HashMap::new();
        for (path, bytes) in &self.targets {
            target_map.insert(path.clone(), FileInfo::from_bytes(bytes));
            write(dir.path(), &format!("targets/{path}"), bytes);
        }
        let targets_signer = if self.targets_signed_with_timestamp_key {
            &timestamp_key
        } else {
            &targets_key
        };
        let targets_bytes = sign_role(
            Targets {
                ts: issued,
                expires: content_expires,
                targets: target_map,
                delegations: if self.delegated.is_empty() {
                    None
                } else {
                    Some(Delegations {
                        keys: delegation_keys,
                        roles: delegation_roles,
                    })
                },
                _extra: HashMap::new(),
            },
            targets_signer,
        );
        write(dir.path(), &format!("meta/{TARGETS_FILENAME}"), &targets_bytes);

        let root_bytes = sign_role(
            build_root(&root_key, &timestamp_key, &release_key, &targets_key, issued, expires),
            &root_key,
        );
        write(dir.path(), &format!("meta/{ROOT_FILENAME}"), &root_bytes);

        release_meta.insert(ROOT_FILENAME.to_owned(), FileInfo::from_bytes(&root_bytes));
        release_meta.insert(
            TARGETS_FILENAME.to_owned(),
            FileInfo::from_bytes(&targets_bytes),
        );

        let timestamp_expires = if self.expired_timestamp {
            Utc::now() - Duration::hours(1)
        } else {
            expires
        };
        let mut repo = BuiltRepo {
            dir,
            root_bytes,
            root_key,
            timestamp_key,
            release_key,
            targets_key,
            release_meta,
            issued,
            content_expires,
            timestamp_expires,
        };
        repo.write_manifest_chain();
        repo
    }
}

pub struct BuiltRepo {
    dir: TempDir,
    root_bytes: Vec<u8>,
    root_key: RoleKey,
    timestamp_key: RoleKey,
    release_key: RoleKey,
    targets_key: RoleKey,
    release_meta: HashMap<String, FileInfo>,
    issued: DateTime<Utc>,
    content_expires: DateTime<Utc>,
    timestamp_expires: DateTime<Utc>,
}

impl BuiltRepo {
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Re-signs and rewrites the release manifest, and the timestamp pinning it, from the
    /// current `release_meta`.
    fn write_manifest_chain(&mut self) {
        let release_bytes = sign_role(
            Release {
                ts: self.issued,
                expires: self.content_expires,
                meta: self.release_meta.clone(),
                _extra: HashMap::new(),
            },
            &self.release_key,
        );
        write(
            self.dir.path(),
            &format!("meta/{RELEASE_FILENAME}"),
            &release_bytes,
        );

        let mut timestamp_meta = HashMap::new();
        timestamp_meta.insert(
            RELEASE_FILENAME.to_owned(),
            FileInfo::from_bytes(&release_bytes),
        );
        let timestamp_bytes = sign_role(
            Timestamp {
                ts: self.issued,
                expires: self.timestamp_expires,
                meta: timestamp_meta,
                _extra: HashMap::new(),
            },
            &self.timestamp_key,
        );
        write(
            self.dir.path(),
            &format!("meta/{TIMESTAMP_FILENAME}"),
            &timestamp_bytes,
        );
    }

    /// Publishes a new root whose root role uses a fresh key. The replacement is signed by
    /// both the outgoing and the incoming root keys, so clients that trust the old root can
    /// follow the hand-off.
    pub fn rotate_root(&mut self) {
        let new_root_key = generate_key();
        let root = build_root(
            &new_root_key,
            &self.timestamp_key,
            &self.release_key,
            &self.targets_key,
            self.issued,
            Utc::now() + Duration::days(730),
        );
        let bytes = sign_role_with(root, &[&self.root_key, &new_root_key]);
        self.install_root(bytes);
        self.root_key = new_root_key;
    }

    /// Publishes a new root signed only by its own fresh key. Clients holding the old root
    /// have no chain of custody to it and must reject it.
    pub fn rotate_root_without_handoff(&mut self) {
        let new_root_key = generate_key();
        let root = build_root(
            &new_root_key,
            &self.timestamp_key,
            &self.release_key,
            &self.targets_key,
            self.issued,
            Utc::now() + Duration::days(730),
        );
        let bytes = sign_role(root, &new_root_key);
        self.install_root(bytes);
    }

    fn install_root(&mut self, bytes: Vec<u8>) {
        write(self.dir.path(), &format!("meta/{ROOT_FILENAME}"), &bytes);
        self.release_meta
            .insert(ROOT_FILENAME.to_owned(), FileInfo::from_bytes(&bytes));
        self.write_manifest_chain();
    }

    pub fn settings(&self) -> Settings {
        Settings {
            root: self.root_bytes.clone(),
            datastore: None,
            mirrors: vec![Mirror::new(
                Url::from_directory_path(self.dir.path()).unwrap(),
            )],
            limits: Limits::default(),
            expiration_enforcement: ExpirationEnforcement::Safe,
        }
    }

    pub async fn load(&self) -> Result<Repository> {
        self.load_with(self.settings()).await
    }

    pub async fn load_with(&self, settings: Settings) -> Result<Repository> {
        Repository::load(FilesystemTransport, settings).await
    }
}
