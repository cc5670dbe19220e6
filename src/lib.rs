#![deny(rust_2018_idioms)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

//! updraft is a client library for secure software update repositories.
//!
//! A repository publishes a small set of signed metadata files and a tree of target files.
//! This crate refreshes that metadata over untrusted mirrors, verifies every step against a
//! locally held root of trust, and only then hands out target file information and bytes.
//!
//! Trust flows in one direction. The `root` metadata (obtained out of band) declares keys
//! and thresholds for every role. The `timestamp` metadata is re-fetched on every refresh
//! and pins the `release` manifest by hash and length; the `release` manifest pins every
//! other metadata file the same way; `targets` metadata (and any roles it delegates to)
//! declares the target files themselves. A mirror can therefore withhold files, but it
//! cannot substitute them.
//!
//! All downloaded metadata is cached in a local datastore, so a client that cannot reach
//! any mirror continues operating on its last known good view until that view expires.

mod datastore;
mod download;
pub mod error;
#[cfg(feature = "http")]
mod http;
mod io;
pub mod key_source;
mod keydb;
pub mod schema;
pub mod sign;
mod transport;
mod urlpath;
mod verify;

pub use crate::error::{Error, Result};
#[cfg(feature = "http")]
pub use crate::http::{HttpTransport, HttpTransportBuilder};
pub use crate::transport::{
    DefaultTransport, FilesystemTransport, IntoVec, Transport, TransportError,
    TransportErrorKind, TransportStream,
};

use crate::datastore::Datastore;
use crate::io::ChecksumStream;
use crate::keydb::KeyDb;
use crate::schema::{
    metadata_filename, FileInfo, HashAlgorithm, PathPattern, Release, Role, Root, Signed,
    Targets, Timestamp, RELEASE_FILENAME, ROOT_FILENAME, TARGETS_FILENAME, TIMESTAMP_FILENAME,
};
use crate::verify::check_signatures;
use async_recursion::async_recursion;
use chrono::{DateTime, Utc};
use log::warn;
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use url::Url;

/// The remote directory that metadata files live under, relative to a mirror's base URL.
const METADATA_PREFIX: &str = "meta";
/// The remote directory that target files live under, relative to a mirror's base URL.
const TARGETS_PREFIX: &str = "targets";

/// The maximum number of delegation levels a target resolution will walk. A repository this
/// deep is a bug or an attack, not a layout.
const MAX_DELEGATION_DEPTH: usize = 32;

/// Role metadata filenames can contain `/` (delegated role names are hierarchical), which
/// must not create directory structure in the datastore.
const FILENAME_ENCODE_SET: &AsciiSet = &CONTROLS.add(b'/').add(b'\\').add(b'%');

fn encode_filename<S: AsRef<str>>(name: S) -> String {
    percent_encode(name.as_ref().as_bytes(), FILENAME_ENCODE_SET).to_string()
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Limits on the size of metadata fetched from mirrors. A file whose expected size is pinned
/// by an already-verified manifest is fetched with that exact size instead; these limits
/// bound the files (and first fetches) that have no pinned size yet.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum size in bytes of root metadata.
    pub max_root_size: u64,
    /// Maximum size in bytes of timestamp metadata. Timestamp is fetched on every refresh
    /// with no prior size pin, so this limit is load-bearing.
    pub max_timestamp_size: u64,
    /// Maximum size in bytes of the release manifest.
    pub max_release_size: u64,
    /// Maximum size in bytes of a targets metadata file.
    pub max_targets_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_root_size: 1024 * 1024,
            max_timestamp_size: 512 * 1024,
            max_release_size: 10 * 1024 * 1024,
            max_targets_size: 10 * 1024 * 1024,
        }
    }
}

/// Whether or not to fail when metadata has expired.
///
/// Unsafe expiration enforcement is a last resort for disaster recovery of a repository
/// whose signing infrastructure is temporarily down. It disables the freeze-attack defense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationEnforcement {
    /// Expired metadata is an error.
    Safe,
    /// Expired metadata is accepted.
    Unsafe,
}

impl Default for ExpirationEnforcement {
    fn default() -> Self {
        ExpirationEnforcement::Safe
    }
}

/// One mirror a repository's files may be fetched from, and the relative paths it serves.
#[derive(Debug, Clone)]
pub struct Mirror {
    /// The base URL that `meta/` and `targets/` paths are joined to. Must end with a
    /// trailing slash for joining to behave.
    pub url_base: Url,
    /// Patterns for the relative paths this mirror serves, e.g. `meta/*` or `**`.
    pub paths: Vec<PathPattern>,
}

impl Mirror {
    /// A mirror that serves every path under `url_base`.
    pub fn new(url_base: Url) -> Self {
        Self {
            url_base,
            paths: vec![PathPattern::new("**")],
        }
    }

    fn serves(&self, path: &str) -> bool {
        schema::any_pattern_matches(&self.paths, path)
    }
}

/// Settings for loading a [`Repository`].
#[derive(Debug, Clone)]
pub struct Settings {
    /// The trusted root metadata bytes, obtained out of band. Everything else is verified
    /// against this.
    pub root: Vec<u8>,
    /// Where to cache trusted metadata between runs. `None` uses a temporary directory that
    /// is discarded on drop.
    pub datastore: Option<PathBuf>,
    /// The mirrors to fetch from. Tried in order for each file; the first verified success
    /// wins.
    pub mirrors: Vec<Mirror>,
    /// Size limits for metadata fetched without a pinned size.
    pub limits: Limits,
    /// Whether expired metadata is an error.
    pub expiration_enforcement: ExpirationEnforcement,
}

/// A target file a trusted role vouches for.
#[derive(Debug, Clone)]
pub struct TrustedTarget {
    /// The target's relative path within the repository.
    pub path: String,
    /// The expected length and hashes.
    pub fileinfo: FileInfo,
    /// The role that declared this target.
    pub role: String,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A client's view of a remote repository: verified metadata, the trust store derived from
/// it, and the machinery to refresh both.
#[derive(Debug, Clone)]
pub struct Repository {
    transport: Box<dyn Transport>,
    mirrors: Vec<Mirror>,
    datastore: Datastore,
    keydb: KeyDb,
    root: Signed<Root>,
    timestamp: Option<Signed<Timestamp>>,
    release: Option<Signed<Release>>,
    targets: Option<Signed<Targets>>,
    delegated_targets: HashMap<String, Signed<Targets>>,
    /// File info computed over the cached bytes of each metadata file, keyed by the file's
    /// relative name (`release.txt`, `targets/plugins.txt`, ...). Compared against manifest
    /// entries to skip re-fetching unchanged files.
    fileinfo_cache: HashMap<String, FileInfo>,
    limits: Limits,
    expiration_enforcement: ExpirationEnforcement,
}

impl Repository {
    /// Loads a repository from the trusted root in `settings` plus whatever previously
    /// trusted metadata survives in the datastore. Does not touch the network; call
    /// [`refresh`](Self::refresh) to synchronize with the mirrors.
    pub async fn load<T: Transport + 'static>(
        transport: T,
        settings: Settings,
    ) -> Result<Repository> {
        let datastore = Datastore::new(settings.datastore)?;

        let root: Signed<Root> =
            serde_json::from_slice(&settings.root).context(error::ParseTrustedRootSnafu)?;
        let keydb = KeyDb::from_root(&root.signed)?;
        check_signatures(&root, &keydb, "root")?;

        let mut repository = Repository {
            transport: Box::new(transport),
            mirrors: settings.mirrors,
            datastore,
            keydb,
            root,
            timestamp: None,
            release: None,
            targets: None,
            delegated_targets: HashMap::new(),
            fileinfo_cache: HashMap::new(),
            limits: settings.limits,
            expiration_enforcement: settings.expiration_enforcement,
        };

        let now = repository.datastore.system_time().await?;
        repository.check_expiration("root", &repository.root.signed.clone(), now)?;
        repository.load_cached_metadata(now).await?;
        Ok(repository)
    }

    /// Synchronizes with the mirrors: timestamp, then the release manifest, then root, then
    /// targets metadata. Each file is only re-fetched when the chain of manifests says it
    /// changed, and nothing already trusted is replaced unless its replacement verifies.
    pub async fn refresh(&mut self) -> Result<()> {
        let now = self.datastore.system_time().await?;
        self.update_timestamp(now).await?;
        self.update_release(now).await?;
        self.update_root(now).await?;
        self.update_targets(now).await?;
        Ok(())
    }

    /// The currently trusted root metadata.
    pub fn root(&self) -> &Signed<Root> {
        &self.root
    }

    /// The currently trusted timestamp metadata, if a refresh (now or in a previous run)
    /// has established one.
    pub fn timestamp(&self) -> Option<&Signed<Timestamp>> {
        self.timestamp.as_ref()
    }

    /// The currently trusted release manifest, if established.
    pub fn release(&self) -> Option<&Signed<Release>> {
        self.release.as_ref()
    }

    /// The currently trusted top-level targets metadata, if established.
    pub fn targets(&self) -> Option<&Signed<Targets>> {
        self.targets.as_ref()
    }

    /// Resolves every target currently vouched for by the trusted `targets` role and its
    /// delegations. Fetches delegated role metadata as needed.
    pub async fn get_all_targets(&mut self) -> Result<Vec<TrustedTarget>> {
        self.get_targets_of_role("targets").await
    }

    /// Resolves every target vouched for by `role` and the roles it delegates to. Fetches
    /// delegated role metadata as needed.
    pub async fn get_targets_of_role(&mut self, role: &str) -> Result<Vec<TrustedTarget>> {
        ensure!(
            self.keydb.role_exists(role),
            error::UnknownRoleSnafu { name: role }
        );
        let mut found = HashMap::new();
        let mut visited = HashSet::new();
        self.collect_targets(role, 0, &mut visited, &mut found)
            .await?;
        let mut targets: Vec<TrustedTarget> = found.into_values().collect();
        targets.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(targets)
    }

    /// Resolves a single target path to its trusted description.
    pub async fn get_target(&mut self, path: &str) -> Result<TrustedTarget> {
        validate_target_name(path)?;
        let mut found = HashMap::new();
        let mut visited = HashSet::new();
        self.collect_targets("targets", 0, &mut visited, &mut found)
            .await?;
        found
            .remove(path)
            .context(error::TargetNotFoundSnafu { path })
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    fn check_expiration<T: Role>(&self, role: &str, signed: &T, now: DateTime<Utc>) -> Result<()> {
        if self.expiration_enforcement == ExpirationEnforcement::Safe {
            ensure!(
                signed.expires() >= now,
                error::ExpiredMetadataSnafu {
                    role,
                    expires: signed.expires()
                }
            );
        }
        Ok(())
    }

    /// Re-establishes previously trusted metadata from the datastore, quietly skipping
    /// anything that no longer verifies against the current trust store or has expired.
    async fn load_cached_metadata(&mut self, now: DateTime<Utc>) -> Result<()> {
        // A cached root is a later generation than the bootstrap root; it must verify
        // under the bootstrap root's keys before it replaces them.
        if let Some(bytes) = self.datastore.current_bytes(ROOT_FILENAME).await? {
            match serde_json::from_slice::<Signed<Root>>(&bytes) {
                Ok(cached) => {
                    if check_signatures(&cached, &self.keydb, "root").is_ok()
                        && self.check_expiration("root", &cached.signed, now).is_ok()
                    {
                        match KeyDb::from_root(&cached.signed) {
                            Ok(keydb) => {
                                if check_signatures(&cached, &keydb, "root").is_ok() {
                                    self.fileinfo_cache.insert(
                                        ROOT_FILENAME.to_owned(),
                                        FileInfo::from_bytes(&bytes),
                                    );
                                    self.root = cached;
                                    self.keydb = keydb;
                                }
                            }
                            Err(e) => warn!("ignoring cached root metadata: {e}"),
                        }
                    }
                }
                Err(e) => warn!("ignoring unparseable cached root metadata: {e}"),
            }
        }

        if let Some(timestamp) = self
            .load_cached_role::<Timestamp>(TIMESTAMP_FILENAME, "timestamp", now)
            .await?
        {
            self.timestamp = Some(timestamp);
        }
        if let Some(release) = self
            .load_cached_role::<Release>(RELEASE_FILENAME, "release", now)
            .await?
        {
            self.release = Some(release);
        }
        if let Some(targets) = self
            .load_cached_role::<Targets>(TARGETS_FILENAME, "targets", now)
            .await?
        {
            if let Some(delegations) = &targets.signed.delegations {
                let delegations = delegations.clone();
                if let Err(e) = self.import_delegations("targets", &delegations) {
                    warn!("ignoring cached delegations of 'targets': {e}");
                } else {
                    self.load_cached_delegated_roles(&delegations, now).await?;
                }
            }
            self.targets = Some(targets);
        }
        Ok(())
    }

    async fn load_cached_role<T>(
        &mut self,
        filename: &str,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Signed<T>>>
    where
        T: Role + serde::de::DeserializeOwned,
    {
        let encoded = encode_filename(filename);
        let Some(bytes) = self.datastore.current_bytes(&encoded).await? else {
            return Ok(None);
        };
        let parsed: Signed<T> = match serde_json::from_slice(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("evicting unparseable cached metadata for '{role}': {e}");
                self.datastore.remove(&encoded).await?;
                return Ok(None);
            }
        };
        if let Err(e) = check_signatures(&parsed, &self.keydb, role) {
            warn!("evicting cached metadata for '{role}': {e}");
            self.datastore.remove(&encoded).await?;
            return Ok(None);
        }
        if let Err(e) = self.check_expiration(role, &parsed.signed, now) {
            warn!("evicting cached metadata for '{role}': {e}");
            self.datastore.remove(&encoded).await?;
            return Ok(None);
        }
        self.fileinfo_cache
            .insert(filename.to_owned(), FileInfo::from_bytes(&bytes));
        Ok(Some(parsed))
    }

    #[async_recursion]
    async fn load_cached_delegated_roles(
        &mut self,
        delegations: &schema::Delegations,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for role in &delegations.roles {
            let filename = metadata_filename(&role.name);
            let Some(targets) = self
                .load_cached_role::<Targets>(&filename, &role.name, now)
                .await?
            else {
                continue;
            };
            if let Some(child_delegations) = &targets.signed.delegations {
                let child_delegations = child_delegations.clone();
                if let Err(e) = self.import_delegations(&role.name, &child_delegations) {
                    warn!("ignoring cached delegations of '{}': {e}", role.name);
                } else {
                    self.load_cached_delegated_roles(&child_delegations, now)
                        .await?;
                }
            }
            self.delegated_targets.insert(role.name.clone(), targets);
        }
        Ok(())
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Fetches and verifies fresh timestamp metadata. Timestamp is the one file with no
    /// manifest pinning it, so it is always fetched and only its signatures and expiration
    /// protect it.
    async fn update_timestamp(&mut self, now: DateTime<Utc>) -> Result<()> {
        let rel = format!("{METADATA_PREFIX}/{TIMESTAMP_FILENAME}");
        let bytes = self
            .fetch_file_bytes(&rel, None, self.limits.max_timestamp_size, "max_timestamp_size")
            .await?;
        let timestamp: Signed<Timestamp> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu { role: "timestamp" })?;
        check_signatures(&timestamp, &self.keydb, "timestamp")?;
        self.check_expiration("timestamp", &timestamp.signed, now)?;

        self.datastore.install(TIMESTAMP_FILENAME, &bytes).await?;
        self.fileinfo_cache
            .insert(TIMESTAMP_FILENAME.to_owned(), FileInfo::from_bytes(&bytes));
        self.timestamp = Some(timestamp);
        Ok(())
    }

    /// Fetches and verifies the release manifest if the timestamp says it changed.
    async fn update_release(&mut self, now: DateTime<Utc>) -> Result<()> {
        // update_timestamp always runs first.
        let reference = self
            .timestamp
            .as_ref()
            .and_then(|t| t.signed.release_info())
            .context(error::MetaMissingSnafu {
                file: RELEASE_FILENAME,
                role: "timestamp",
            })?
            .clone();

        // An unchanged manifest entry means the bytes have not changed, not that the copy we
        // hold is still fresh; the retained copy must pass the expiration check every refresh.
        if let (Some(release), Some(cached)) = (&self.release, self.fileinfo_cache.get(RELEASE_FILENAME)) {
            if !reference.differs_from(cached) {
                self.check_expiration("release", &release.signed, now)?;
                return Ok(());
            }
        }

        let rel = format!("{METADATA_PREFIX}/{RELEASE_FILENAME}");
        let bytes = self
            .fetch_file_bytes(&rel, Some(&reference), self.limits.max_release_size, "max_release_size")
            .await?;
        let release: Signed<Release> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu { role: "release" })?;
        check_signatures(&release, &self.keydb, "release")?;
        self.check_expiration("release", &release.signed, now)?;

        self.datastore.install(RELEASE_FILENAME, &bytes).await?;
        self.fileinfo_cache
            .insert(RELEASE_FILENAME.to_owned(), FileInfo::from_bytes(&bytes));
        self.release = Some(release);
        Ok(())
    }

    /// Fetches and verifies new root metadata if the release manifest says it changed. A
    /// replacement root must verify under the keys of the root it replaces as well as its
    /// own, so key rotation is an explicit hand-off.
    async fn update_root(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(reference) = self.release_manifest_entry(ROOT_FILENAME) else {
            return error::MetaMissingSnafu {
                file: ROOT_FILENAME,
                role: "release",
            }
            .fail();
        };

        if let Some(cached) = self.fileinfo_cache.get(ROOT_FILENAME) {
            if !reference.differs_from(cached) {
                self.check_expiration("root", &self.root.signed, now)?;
                return Ok(());
            }
        }

        let rel = format!("{METADATA_PREFIX}/{ROOT_FILENAME}");
        let bytes = self
            .fetch_file_bytes(&rel, Some(&reference), self.limits.max_root_size, "max_root_size")
            .await?;
        let root: Signed<Root> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu { role: "root" })?;

        check_signatures(&root, &self.keydb, "root")?;
        let keydb = KeyDb::from_root(&root.signed)?;
        check_signatures(&root, &keydb, "root")?;
        self.check_expiration("root", &root.signed, now)?;

        self.datastore.install(ROOT_FILENAME, &bytes).await?;
        self.fileinfo_cache
            .insert(ROOT_FILENAME.to_owned(), FileInfo::from_bytes(&bytes));
        self.root = root;
        self.keydb = keydb;

        // The new trust store starts with only the top-level roles. Delegated roles whose
        // metadata we already hold re-enter through their parents, parents first; anything
        // that no longer fits the new trust store is dropped.
        self.reimport_delegations();
        Ok(())
    }

    /// Fetches and verifies top-level targets metadata if the release manifest says it
    /// changed. Replacing targets metadata drops every delegated role derived from the old
    /// copy; they re-enter through the new delegations as resolution walks them.
    async fn update_targets(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(reference) = self.release_manifest_entry(TARGETS_FILENAME) else {
            return error::MetaMissingSnafu {
                file: TARGETS_FILENAME,
                role: "release",
            }
            .fail();
        };

        if let (Some(targets), Some(cached)) = (&self.targets, self.fileinfo_cache.get(TARGETS_FILENAME)) {
            if !reference.differs_from(cached) {
                self.check_expiration("targets", &targets.signed, now)?;
                return Ok(());
            }
        }

        let rel = format!("{METADATA_PREFIX}/{TARGETS_FILENAME}");
        let bytes = self
            .fetch_file_bytes(&rel, Some(&reference), self.limits.max_targets_size, "max_targets_size")
            .await?;
        let targets: Signed<Targets> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu { role: "targets" })?;
        check_signatures(&targets, &self.keydb, "targets")?;
        self.check_expiration("targets", &targets.signed, now)?;

        self.datastore.install(TARGETS_FILENAME, &bytes).await?;
        self.fileinfo_cache
            .insert(TARGETS_FILENAME.to_owned(), FileInfo::from_bytes(&bytes));

        if self.keydb.role_exists("targets") {
            self.keydb.remove_delegated_roles("targets")?;
        }
        self.delegated_targets.clear();
        if let Some(delegations) = &targets.signed.delegations {
            self.import_delegations("targets", delegations)?;
        }
        self.targets = Some(targets);
        Ok(())
    }

    fn release_manifest_entry(&self, filename: &str) -> Option<FileInfo> {
        self.release
            .as_ref()
            .and_then(|r| r.signed.meta.get(filename))
            .cloned()
    }

    /// Registers a verified delegations block in the trust store. Keys already present are
    /// left alone (keys may legitimately be shared across blocks).
    fn import_delegations(
        &mut self,
        _parent: &str,
        delegations: &schema::Delegations,
    ) -> Result<()> {
        for (keyid, key) in &delegations.keys {
            if !self.keydb.has_key(keyid) {
                self.keydb.add_key(keyid.clone(), key.clone())?;
            }
        }
        for role in &delegations.roles {
            self.keydb.add_role(&role.name, role.role_keys(), true)?;
        }
        Ok(())
    }

    /// Re-registers delegated roles after the trust store was rebuilt, walking parents
    /// before children. Metadata that no longer fits (its parent vanished, its keys are
    /// unknown) is dropped with a warning rather than failing the refresh.
    fn reimport_delegations(&mut self) {
        let mut blocks: Vec<(String, schema::Delegations)> = Vec::new();
        if let Some(targets) = &self.targets {
            if let Some(delegations) = &targets.signed.delegations {
                blocks.push(("targets".to_owned(), delegations.clone()));
            }
        }
        let mut names: Vec<String> = self.delegated_targets.keys().cloned().collect();
        names.sort_by_key(|name| name.matches('/').count());
        for name in names {
            if let Some(delegations) = self
                .delegated_targets
                .get(&name)
                .and_then(|t| t.signed.delegations.clone())
            {
                blocks.push((name, delegations));
            }
        }

        let mut dropped: Vec<String> = Vec::new();
        for (parent, delegations) in blocks {
            if parent != "targets" && !self.keydb.role_exists(&parent) {
                dropped.push(parent);
                continue;
            }
            if let Err(e) = self.import_delegations(&parent, &delegations) {
                warn!("dropping delegations of '{parent}' after root change: {e}");
                if parent != "targets" {
                    dropped.push(parent);
                }
            }
        }
        for name in dropped {
            self.delegated_targets.remove(&name);
        }
        self.delegated_targets
            .retain(|name, _| self.keydb.role_exists(name));
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Collects the targets of `role` and everything it delegates to into `found`. Entries
    /// outside the path patterns granted by the role's ancestors are excluded with a
    /// warning; two roles describing the same path differently is an error.
    #[async_recursion]
    async fn collect_targets(
        &mut self,
        role: &str,
        depth: usize,
        visited: &mut HashSet<String>,
        found: &mut HashMap<String, TrustedTarget>,
    ) -> Result<()> {
        ensure!(
            depth <= MAX_DELEGATION_DEPTH,
            error::DelegationDepthExceededSnafu {
                role,
                limit: MAX_DELEGATION_DEPTH
            }
        );
        ensure!(
            visited.insert(role.to_owned()),
            error::DelegationCycleSnafu { role }
        );

        let targets = self.role_targets(role).await?;

        // Every restriction on the chain from the top applies, not just the nearest one.
        let mut restrictions: Vec<Vec<PathPattern>> = Vec::new();
        for ancestor in self
            .keydb
            .parent_roles(role)
            .into_iter()
            .map(str::to_owned)
            .chain(std::iter::once(role.to_owned()))
        {
            if let Some(paths) = self.keydb.role_paths(&ancestor) {
                restrictions.push(paths.to_vec());
            }
        }

        for (path, fileinfo) in &targets.signed.targets {
            let authorized = restrictions
                .iter()
                .all(|patterns| schema::any_pattern_matches(patterns, path));
            if !authorized {
                warn!("role '{role}' is not authorized for target path '{path}'; ignoring entry");
                continue;
            }
            match found.get(path) {
                Some(existing)
                    if existing.fileinfo.differs_from(fileinfo)
                        || fileinfo.differs_from(&existing.fileinfo) =>
                {
                    return error::AmbiguousTargetSnafu { path }.fail();
                }
                Some(_) => (),
                None => {
                    found.insert(
                        path.clone(),
                        TrustedTarget {
                            path: path.clone(),
                            fileinfo: fileinfo.clone(),
                            role: role.to_owned(),
                        },
                    );
                }
            }
        }

        if let Some(delegations) = &targets.signed.delegations {
            let children: Vec<String> = delegations
                .roles
                .iter()
                .map(|r| r.name.clone())
                .filter(|name| self.keydb.role_exists(name))
                .collect();
            for child in children {
                self.collect_targets(&child, depth + 1, visited, found)
                    .await?;
            }
        }
        Ok(())
    }

    /// Returns the trusted targets metadata for `role`, fetching and verifying it first if
    /// the release manifest says our copy is stale or we have none.
    async fn role_targets(&mut self, role: &str) -> Result<Signed<Targets>> {
        if role == "targets" {
            return self
                .targets
                .clone()
                .context(error::MetadataNotAvailableSnafu { role });
        }

        match self.load_delegated_role_targets(role).await {
            Ok(targets) => Ok(targets),
            Err(e) => {
                // The role was delegated to but its metadata cannot be established. Nothing
                // previously derived from this role may stay trusted, but the parent's own
                // last known good metadata does.
                if e.is_availability() {
                    if self.keydb.role_exists(role) {
                        let _ = self.keydb.remove_delegated_roles(role);
                    }
                    let prefix = format!("{role}/");
                    self.delegated_targets
                        .retain(|name, _| name != role && !name.starts_with(&prefix));
                }
                Err(e)
            }
        }
    }

    async fn load_delegated_role_targets(&mut self, role: &str) -> Result<Signed<Targets>> {
        let filename = metadata_filename(role);
        let reference = self
            .release_manifest_entry(&filename)
            .context(error::MetadataNotAvailableSnafu { role })?;

        let now = self.datastore.system_time().await?;
        if let Some(cached) = self.delegated_targets.get(role) {
            if let Some(cached_info) = self.fileinfo_cache.get(&filename) {
                if !reference.differs_from(cached_info) {
                    self.check_expiration(role, &cached.signed, now)?;
                    return Ok(cached.clone());
                }
            }
        }
        let rel = format!("{METADATA_PREFIX}/{filename}");
        let bytes = self
            .fetch_file_bytes(&rel, Some(&reference), self.limits.max_targets_size, "max_targets_size")
            .await?;
        let targets: Signed<Targets> =
            serde_json::from_slice(&bytes).context(error::ParseMetadataSnafu { role })?;
        check_signatures(&targets, &self.keydb, role)?;
        self.check_expiration(role, &targets.signed, now)?;

        self.datastore
            .install(&encode_filename(&filename), &bytes)
            .await?;
        self.fileinfo_cache
            .insert(filename, FileInfo::from_bytes(&bytes));

        // Replacing a role's metadata invalidates everything derived from the old copy.
        if self.keydb.role_exists(role) {
            self.keydb.remove_delegated_roles(role)?;
        }
        let prefix = format!("{role}/");
        self.delegated_targets
            .retain(|name, _| !name.starts_with(&prefix));
        if let Some(delegations) = &targets.signed.delegations {
            self.import_delegations(role, delegations)?;
        }
        self.delegated_targets
            .insert(role.to_owned(), targets.clone());
        Ok(targets)
    }

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    /// Fetches `rel` from the first mirror that serves it and produces bytes matching
    /// `reference` (when given). A mirror whose bytes fail verification counts as a failed
    /// attempt; the next mirror is tried.
    async fn fetch_file_bytes(
        &self,
        rel: &str,
        reference: Option<&FileInfo>,
        limit: u64,
        specifier: &'static str,
    ) -> Result<Vec<u8>> {
        if let Some(reference) = reference {
            ensure_supported_algorithms(reference)?;
        }

        let max_size = reference.map_or(limit, |r| r.length.min(limit));
        let mut attempts = Vec::new();
        let mut any_mirror = false;
        for mirror in self.mirrors.iter().filter(|m| m.serves(rel)) {
            any_mirror = true;
            let url = mirror
                .url_base
                .join(rel)
                .context(error::JoinUrlSnafu {
                    path: rel,
                    url: mirror.url_base.clone(),
                })?;
            match self
                .fetch_verified(url.clone(), max_size, specifier, reference)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!("failed to fetch '{url}': {e}");
                    attempts.push(format!("{url}: {e}"));
                }
            }
        }

        if !any_mirror {
            return error::NoMatchingMirrorSnafu { path: rel }.fail();
        }
        error::DownloadSnafu {
            path: rel,
            attempts,
        }
        .fail()
    }

    async fn fetch_verified(
        &self,
        url: Url,
        max_size: u64,
        specifier: &'static str,
        reference: Option<&FileInfo>,
    ) -> Result<Vec<u8>> {
        let stream = self
            .transport
            .fetch(url.clone())
            .await
            .with_context(|_| error::TransportSnafu { url: url.clone() })?;
        let stream = ChecksumStream::new(
            stream,
            url.clone(),
            max_size,
            specifier,
            reference.and_then(FileInfo::sha256).map(AsRef::as_ref),
        );
        let bytes = stream
            .into_vec()
            .await
            .with_context(|_| error::TransportSnafu { url: url.clone() })?;
        if let Some(reference) = reference {
            verify_fileinfo(&bytes, reference, url.as_str())?;
        }
        Ok(bytes)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Checks `bytes` against a trusted description: exact length, and every hash the
/// description carries.
pub(crate) fn verify_fileinfo(bytes: &[u8], fileinfo: &FileInfo, what: &str) -> Result<()> {
    ensure!(
        bytes.len() as u64 == fileinfo.length,
        error::LengthMismatchSnafu {
            path: what,
            calculated: bytes.len() as u64,
            expected: fileinfo.length
        }
    );
    for (algorithm, expected) in &fileinfo.hashes {
        let calculated = algorithm
            .digest(bytes)
            .context(error::UnsupportedHashAlgorithmSnafu {
                algorithm: algorithm.to_string(),
            })?;
        ensure!(
            calculated.as_slice() == expected.as_ref(),
            error::HashMismatchSnafu {
                context: format!("{what} ({algorithm})"),
                calculated: hex::encode(&calculated),
                expected: hex::encode(expected),
            }
        );
    }
    Ok(())
}

/// A description naming an algorithm we cannot compute can never be satisfied; refuse it
/// before spending a download on it.
pub(crate) fn ensure_supported_algorithms(fileinfo: &FileInfo) -> Result<()> {
    for algorithm in fileinfo.hashes.keys() {
        if let HashAlgorithm::Unknown(name) = algorithm {
            return error::UnsupportedHashAlgorithmSnafu { algorithm: name }.fail();
        }
    }
    Ok(())
}

/// Target names are relative paths inside the repository's target tree and must stay there.
pub(crate) fn validate_target_name(name: &str) -> Result<()> {
    ensure!(
        !name.is_empty(),
        error::InvalidTargetNameSnafu {
            name,
            reason: "empty name"
        }
    );
    ensure!(
        !name.starts_with('/'),
        error::InvalidTargetNameSnafu {
            name,
            reason: "absolute path"
        }
    );
    ensure!(
        name.split('/').all(|component| component != ".." && component != "."),
        error::InvalidTargetNameSnafu {
            name,
            reason: "path traversal component"
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_encoding_flattens_hierarchy() {
        assert_eq!(encode_filename("targets.txt"), "targets.txt");
        assert_eq!(
            encode_filename("targets/plugins.txt"),
            "targets%2Fplugins.txt"
        );
        assert_eq!(encode_filename("odd%name"), "odd%25name");
    }

    #[test]
    fn target_name_validation() {
        assert!(validate_target_name("plugins/a.so").is_ok());
        assert!(validate_target_name("/etc/passwd").is_err());
        assert!(validate_target_name("a/../../b").is_err());
        assert!(validate_target_name("./a").is_err());
        assert!(validate_target_name("").is_err());
    }

    #[test]
    fn fileinfo_verification() {
        let info = FileInfo::from_bytes(b"hello");
        verify_fileinfo(b"hello", &info, "test").unwrap();
        assert!(matches!(
            verify_fileinfo(b"hellp", &info, "test"),
            Err(Error::HashMismatch { .. })
        ));
        assert!(matches!(
            verify_fileinfo(b"hello!", &info, "test"),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn unknown_algorithm_is_refused() {
        let mut info = FileInfo::from_bytes(b"hello");
        info.hashes
            .insert(HashAlgorithm::Unknown("whirlpool".into()), vec![0u8].into());
        assert!(matches!(
            ensure_supported_algorithms(&info),
            Err(Error::UnsupportedHashAlgorithm { .. })
        ));
    }

    #[test]
    fn mirror_path_patterns() {
        let mirror = Mirror {
            url_base: Url::parse("https://example.com/repo/").unwrap(),
            paths: vec![PathPattern::new("meta/**")],
        };
        assert!(mirror.serves("meta/root.txt"));
        assert!(!mirror.serves("targets/a.so"));

        let all = Mirror::new(Url::parse("https://example.com/repo/").unwrap());
        assert!(all.serves("targets/a.so"));
    }
}
