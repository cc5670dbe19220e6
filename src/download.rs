//! Downloading target files described by trusted metadata.

use crate::error::{self, Result};
use crate::{Repository, TrustedTarget, TARGETS_PREFIX};
use snafu::ResultExt;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

impl Repository {
    /// Fetches the bytes of target `path`. The bytes are verified against the trusted
    /// description (exact length and every declared hash) before they are returned; a
    /// mirror serving anything else counts as a failed attempt.
    pub async fn read_target(&mut self, path: &str) -> Result<Vec<u8>> {
        let target = self.get_target(path).await?;
        self.fetch_target(&target).await
    }

    /// Downloads target `path` to the file at `dest`, creating parent directories as
    /// needed. The destination is written atomically and only after the bytes verified, so
    /// a partial or tampered download never lands at `dest`.
    pub async fn save_target<P: AsRef<Path>>(&mut self, path: &str, dest: P) -> Result<()> {
        let target = self.get_target(path).await?;
        let bytes = self.fetch_target(&target).await?;

        let dest = dest.as_ref();
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(error::DirCreateSnafu { path: parent })?;
        }
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        let mut temp =
            NamedTempFile::new_in(dir).context(error::FileTempCreateSnafu { path: dir })?;
        temp.write_all(&bytes)
            .context(error::FileWriteSnafu { path: dest })?;
        temp.persist(dest)
            .context(error::FilePersistSnafu { path: dest })?;
        Ok(())
    }

    /// Fetches and verifies the bytes of an already-resolved target.
    pub async fn fetch_target(&self, target: &TrustedTarget) -> Result<Vec<u8>> {
        let rel = format!("{TARGETS_PREFIX}/{}", target.path);
        self.fetch_file_bytes(&rel, Some(&target.fileinfo), target.fileinfo.length, "target length")
            .await
    }
}
