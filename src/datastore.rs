//! On-disk cache of the most recently trusted metadata, plus the previous generation.
//!
//! Layout under the datastore root:
//!
//! ```text
//! cur/   - the currently trusted copy of each metadata file
//! prev/  - the copy that was current before the last install
//! ```
//!
//! Installs are atomic: bytes land in a temporary file in `cur/` and are renamed into
//! place, after the old current file (if any) is demoted to `prev/`. A crash at any point
//! leaves either the old or the new file trusted, never a torn one.

use crate::error::{self, Result};
use chrono::{DateTime, Utc};
use log::debug;
use snafu::{ensure, ResultExt};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
pub(crate) struct Datastore {
    /// A lock around retrieving the datastore path.
    path_lock: Arc<RwLock<DatastorePath>>,
    /// A lock to treat the `system_time` function as a critical section.
    time_lock: Arc<Mutex<()>>,
}

impl Datastore {
    /// Creates a datastore at `path`, or in a temporary directory removed on drop if `path`
    /// is `None`. The `cur/` and `prev/` subdirectories are created up front.
    pub(crate) fn new(path: Option<PathBuf>) -> Result<Self> {
        let datastore_path = match path {
            None => DatastorePath::TempDir(TempDir::new().context(error::DatastoreInitSnafu)?),
            Some(p) => DatastorePath::Path(p),
        };
        for dir in ["cur", "prev"] {
            let path = datastore_path.path().join(dir);
            std::fs::create_dir_all(&path).context(error::DatastoreCreateSnafu { path: &path })?;
        }
        Ok(Self {
            path_lock: Arc::new(RwLock::new(datastore_path)),
            time_lock: Arc::new(Mutex::new(())),
        })
    }

    async fn read(&self) -> RwLockReadGuard<'_, DatastorePath> {
        self.path_lock.read().await
    }

    async fn write(&self) -> RwLockWriteGuard<'_, DatastorePath> {
        self.path_lock.write().await
    }

    /// Returns the contents of `file` in `cur/`, or `None` if it has never been installed.
    pub(crate) async fn current_bytes(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let lock = &self.read().await;
        let path = lock.path().join("cur").join(file);
        read_optional(&path).await
    }

    /// Returns the contents of a bookkeeping file at the datastore root.
    async fn bytes(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let lock = &self.read().await;
        let path = lock.path().join(file);
        read_optional(&path).await
    }

    /// Installs `bytes` as the current copy of `file`, demoting any existing current copy to
    /// `prev/`. The write into `cur/` goes through a temporary file and a rename.
    pub(crate) async fn install(&self, file: &str, bytes: &[u8]) -> Result<()> {
        let lock = &self.write().await;
        let cur = lock.path().join("cur").join(file);
        let prev = lock.path().join("prev").join(file);

        if let Some(parent) = cur.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::DatastoreCreateSnafu { path: parent })?;
        }
        if let Some(parent) = prev.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::DatastoreCreateSnafu { path: parent })?;
        }

        match tokio::fs::rename(&cur, &prev).await {
            Ok(()) => debug!("demoted '{}' to '{}'", cur.display(), prev.display()),
            Err(err) => match err.kind() {
                ErrorKind::NotFound => (),
                _ => {
                    return Err(err).context(error::DatastoreRenameSnafu {
                        from: &cur,
                        to: &prev,
                    })
                }
            },
        }

        let dir = cur.parent().unwrap_or_else(|| lock.path());
        let mut temp =
            NamedTempFile::new_in(dir).context(error::FileTempCreateSnafu { path: dir })?;
        temp.write_all(bytes)
            .context(error::DatastoreWriteSnafu { path: &cur })?;
        temp.persist(&cur)
            .context(error::DatastorePersistSnafu { path: &cur })?;
        Ok(())
    }

    /// Writes a JSON bookkeeping file at the datastore root.
    async fn create<T: serde::Serialize>(&self, file: &str, value: &T) -> Result<()> {
        let lock = &self.write().await;
        let path = lock.path().join(file);
        let bytes = serde_json::to_vec(value).with_context(|_| error::DatastoreSerializeSnafu {
            what: format!("{file} in datastore"),
        })?;
        tokio::fs::write(&path, bytes)
            .await
            .context(error::DatastoreCreateSnafu { path: &path })
    }

    /// Deletes `file` from both `cur/` and `prev/`. Missing files are not an error.
    pub(crate) async fn remove(&self, file: &str) -> Result<()> {
        let lock = self.write().await;
        for dir in ["cur", "prev"] {
            let path = lock.path().join(dir).join(file);
            debug!("removing '{}'", path.display());
            match tokio::fs::remove_file(&path).await {
                Ok(()) => (),
                Err(err) => match err.kind() {
                    ErrorKind::NotFound => (),
                    _ => return Err(err).context(error::DatastoreRemoveSnafu { path: &path }),
                },
            }
        }
        Ok(())
    }

    /// Ensures that system time has not stepped backward since it was last sampled.
    /// Freshness reasoning is unsound across a clock rollback, so refreshes refuse to start.
    pub(crate) async fn system_time(&self) -> Result<DateTime<Utc>> {
        // Treat this function as a critical section. This lock is not used for anything else.
        let lock = self.time_lock.lock().await;

        let file = "latest_known_time.json";
        let poss_latest_known_time = self
            .bytes(file)
            .await?
            .map(|b| serde_json::from_slice::<DateTime<Utc>>(&b));

        let sys_time = Utc::now();

        if let Some(Ok(latest_known_time)) = poss_latest_known_time {
            ensure!(
                sys_time >= latest_known_time,
                error::SystemTimeSteppedBackwardSnafu {
                    sys_time,
                    latest_known_time
                }
            );
        }
        self.create(file, &sys_time).await?;

        drop(lock);
        Ok(sys_time)
    }
}

/// Because `TempDir` is an RAII object, we need to hold on to it. This private enum allows us
/// to hold either a `TempDir` or a `PathBuf` depending on whether or not the user wants to
/// manage the directory.
#[derive(Debug)]
enum DatastorePath {
    /// Path to a user-managed directory.
    Path(PathBuf),
    /// A `TempDir` that we created on the user's behalf.
    TempDir(TempDir),
}

impl DatastorePath {
    fn path(&self) -> &Path {
        match self {
            DatastorePath::Path(p) => p,
            DatastorePath::TempDir(t) => t.path(),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(file) => Ok(Some(file)),
        Err(err) => match err.kind() {
            ErrorKind::NotFound => Ok(None),
            _ => Err(err).context(error::DatastoreOpenSnafu { path }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn install_demotes_previous_copy() {
        let datastore = Datastore::new(None).unwrap();
        assert_eq!(datastore.current_bytes("root.txt").await.unwrap(), None);

        datastore.install("root.txt", b"first").await.unwrap();
        assert_eq!(
            datastore.current_bytes("root.txt").await.unwrap(),
            Some(b"first".to_vec())
        );

        datastore.install("root.txt", b"second").await.unwrap();
        assert_eq!(
            datastore.current_bytes("root.txt").await.unwrap(),
            Some(b"second".to_vec())
        );

        let lock = datastore.path_lock.read().await;
        let prev = tokio::fs::read(lock.path().join("prev").join("root.txt"))
            .await
            .unwrap();
        assert_eq!(prev, b"first");
    }

    #[tokio::test]
    async fn remove_clears_both_generations() {
        let datastore = Datastore::new(None).unwrap();
        datastore.install("targets.txt", b"one").await.unwrap();
        datastore.install("targets.txt", b"two").await.unwrap();
        datastore.remove("targets.txt").await.unwrap();
        assert_eq!(datastore.current_bytes("targets.txt").await.unwrap(), None);

        // Removing an absent file is not an error.
        datastore.remove("targets.txt").await.unwrap();
    }

    #[tokio::test]
    async fn system_time_advances() {
        let datastore = Datastore::new(None).unwrap();
        let first = datastore.system_time().await.unwrap();
        let second = datastore.system_time().await.unwrap();
        assert!(second >= first);
    }
}
