//! Writer admission.
//!
//! Owners and writers keep the policy as the replicated `__access` row.
//!  Reader-only drives never author that row: they mirror whatever writer
//!  list they observe into a local JSON cache and admit from there.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crypto::PublicKey;
use crate::index::{AccessRecord, IndexError, IndexProvider, IndexValue, ACCESS_KEY};

/// Name of the reader-only writer cache under the drive's meta dir
pub const WRITER_CACHE_FILE: &str = "writers.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Owner,
    Writer,
    /// Replicates and seeds, but keeps a local mirror of the writer list
    ReaderOnly,
}

/// What a peer added through `add_peer` may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Read,
    Write,
}

/// A peer to replicate with, identified by its writer (diff) key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerGrant {
    pub diff_key: PublicKey,
    pub access: Vec<AccessLevel>,
}

impl PeerGrant {
    pub fn reader(diff_key: PublicKey) -> Self {
        Self {
            diff_key,
            access: vec![AccessLevel::Read],
        }
    }

    pub fn writer(diff_key: PublicKey) -> Self {
        Self {
            diff_key,
            access: vec![AccessLevel::Read, AccessLevel::Write],
        }
    }

    pub fn can_write(&self) -> bool {
        self.access.contains(&AccessLevel::Write)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AccessError<T> {
    #[error("index error: {0}")]
    Index(#[from] IndexError<T>),
    #[error("writer cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("access row holds a {0} value")]
    UnexpectedValue(&'static str),
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("writer cache i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("writer cache is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("writer cache holds an invalid key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WriterCacheFile {
    #[serde(rename = "canWrite", default)]
    can_write: Vec<String>,
}

/// Reader-only mirror of the admitted writer list, persisted as JSON
#[derive(Debug)]
pub struct WriterCache {
    path: PathBuf,
    writers: BTreeSet<PublicKey>,
}

impl WriterCache {
    /// Open the cache in `meta_dir`, starting empty if there is none yet
    pub async fn load(meta_dir: &Path) -> Result<Self, CacheError> {
        let path = meta_dir.join(WRITER_CACHE_FILE);
        let writers = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: WriterCacheFile = serde_json::from_slice(&bytes)?;
                file.can_write
                    .iter()
                    .map(|hex| {
                        PublicKey::from_hex(hex).map_err(|_| CacheError::InvalidKey(hex.clone()))
                    })
                    .collect::<Result<BTreeSet<_>, _>>()?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, writers })
    }

    pub fn contains(&self, writer: &PublicKey) -> bool {
        self.writers.contains(writer)
    }

    pub fn writers(&self) -> Vec<PublicKey> {
        self.writers.iter().copied().collect()
    }

    /// Merge writers in, persisting if anything changed.
    ///  Returns the writers that were new.
    pub async fn merge(&mut self, writers: &[PublicKey]) -> Result<Vec<PublicKey>, CacheError> {
        let added: Vec<PublicKey> = writers
            .iter()
            .filter(|w| self.writers.insert(**w))
            .copied()
            .collect();
        if !added.is_empty() {
            self.persist().await?;
        }
        Ok(added)
    }

    async fn persist(&self) -> Result<(), CacheError> {
        let file = WriterCacheFile {
            can_write: self.writers.iter().map(|w| w.to_hex()).collect(),
        };
        let staged = self.path.with_extension("json.tmp");
        tokio::fs::write(&staged, serde_json::to_vec_pretty(&file)?).await?;
        tokio::fs::rename(&staged, &self.path).await?;
        Ok(())
    }
}

/// The effective access policy of one drive
#[derive(Debug)]
pub struct AccessPolicy<I: IndexProvider> {
    role: Role,
    index: I,
    /// Reader-only drives only
    cache: Option<Mutex<WriterCache>>,
    /// Serializes read-modify-write of the `__access` row
    row_lock: Mutex<()>,
}

impl<I: IndexProvider> AccessPolicy<I> {
    pub async fn open(
        role: Role,
        index: I,
        meta_dir: &Path,
    ) -> Result<Self, AccessError<I::Error>> {
        let cache = match role {
            Role::ReaderOnly => {
                let cache = WriterCache::load(meta_dir).await?;
                // feeds admitted in an earlier session stay admitted
                let known = cache.writers();
                if !known.is_empty() {
                    index.add_writers(&known).await?;
                }
                Some(Mutex::new(cache))
            }
            Role::Owner | Role::Writer => None,
        };
        Ok(Self {
            role,
            index,
            cache,
            row_lock: Mutex::new(()),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Write the initial policy of a freshly bootstrapped drive.
    ///
    /// A reader-only drive records its own feed in the local cache instead.
    pub async fn initialize(&self, owner: PublicKey) -> Result<(), AccessError<I::Error>> {
        if let Some(cache) = &self.cache {
            cache.lock().await.merge(&[owner]).await?;
            self.index.add_writers(&[owner]).await?;
            return Ok(());
        }
        let _guard = self.row_lock.lock().await;
        let mut record = AccessRecord::default();
        record.insert(owner);
        self.index
            .put(ACCESS_KEY, IndexValue::Access(record))
            .await?;
        Ok(())
    }

    /// Current replicated policy row. An absent row reads as the default.
    pub async fn record(&self) -> Result<AccessRecord, AccessError<I::Error>> {
        match self.index.value(ACCESS_KEY).await? {
            None => Ok(AccessRecord::default()),
            Some(IndexValue::Access(record)) => Ok(record),
            Some(IndexValue::Name(_)) => Err(AccessError::UnexpectedValue("name")),
            Some(IndexValue::Content(_)) => Err(AccessError::UnexpectedValue("content")),
            Some(IndexValue::PublicKey { .. }) => Err(AccessError::UnexpectedValue("public key")),
        }
    }

    /// Admit `identity` as a writer.
    ///
    /// Returns whether the effective policy changed. The log store is told
    ///  to admit the feed either way, so a retry after a partial failure
    ///  still lands.
    pub async fn add_writer(&self, identity: PublicKey) -> Result<bool, AccessError<I::Error>> {
        let changed = match &self.cache {
            Some(cache) => !cache.lock().await.merge(&[identity]).await?.is_empty(),
            None => {
                let _guard = self.row_lock.lock().await;
                let mut record = self.record().await?;
                let changed = record.insert(identity);
                if changed {
                    self.index
                        .put(ACCESS_KEY, IndexValue::Access(record))
                        .await?;
                }
                changed
            }
        };
        self.index.add_writers(&[identity]).await?;
        if changed {
            tracing::info!("admitted writer {}", identity.fmt_short());
        }
        Ok(changed)
    }

    pub async fn is_admitted(&self, identity: &PublicKey) -> Result<bool, AccessError<I::Error>> {
        match &self.cache {
            Some(cache) => Ok(cache.lock().await.contains(identity)),
            None => Ok(self.record().await?.contains(identity)),
        }
    }

    /// Fold a replicated `__access` row into the local view.
    ///
    /// Only reader-only drives keep a separate view; for everyone else the
    ///  row already is the policy.
    pub async fn observe(&self, record: &AccessRecord) -> Result<(), AccessError<I::Error>> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let added = cache.lock().await.merge(&record.can_write).await?;
        if !added.is_empty() {
            tracing::debug!("mirrored {} writer(s) from access row", added.len());
            self.index.add_writers(&added).await?;
        }
        Ok(())
    }
}
