use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use crate::crypto::PublicKey;
use crate::drive::{Drive, LocalChange};
use crate::index::MemoryIndex;

/// A drive in its own temporary directory
pub struct TestDrive {
    /// The name of this drive (for debugging)
    pub name: String,
    pub drive: Drive<MemoryIndex>,
    dir: TempDir,
}

impl TestDrive {
    pub(super) fn new(name: String, drive: Drive<MemoryIndex>, dir: TempDir) -> Self {
        Self { name, drive, dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.dir.path().join(filename)
    }

    /// The drive's shared key
    ///
    /// # Panics
    /// If called before `ready()`
    pub fn public_key(&self) -> PublicKey {
        self.drive
            .public_key()
            .expect("test drive used before ready()")
    }

    /// Write a file and index it right away
    pub async fn write(&self, filename: &str, contents: &[u8]) -> Result<LocalChange> {
        tokio::fs::write(self.file_path(filename), contents).await?;
        Ok(self.drive.rescan(filename).await?)
    }

    /// Remove a file and index the removal right away
    pub async fn remove(&self, filename: &str) -> Result<LocalChange> {
        tokio::fs::remove_file(self.file_path(filename)).await?;
        Ok(self.drive.rescan(filename).await?)
    }

    /// File contents, `None` if the file does not exist
    pub async fn read(&self, filename: &str) -> Option<Vec<u8>> {
        tokio::fs::read(self.file_path(filename)).await.ok()
    }

    /// Close the drive and hand back its directory, for reopening
    pub async fn close(self) -> Result<TempDir> {
        tracing::debug!("closing test drive {}", self.name);
        self.drive.close().await?;
        Ok(self.dir)
    }
}
