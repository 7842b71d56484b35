//! Local filesystem changes into index rows.

use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use super::{DriveError, DriveInner};
use crate::crypto::{ContentHash, ContentHasher};
use crate::index::{
    is_plain_filename, ContentEntry, FileRecord, HistoryOptions, IndexProvider, IndexValue,
    NameEntry, ROOT_PATH,
};

/// What a local rescan of one filename did to the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChange {
    /// A fetch is writing to disk; the event is probably our own echo
    Suppressed,
    /// Hidden, ignored by pattern, or not a regular file
    Ignored,
    /// The index already says what the disk says
    Unchanged,
    Indexed(ContentHash),
    Removed(ContentHash),
}

impl<I: IndexProvider> DriveInner<I> {
    /// Whether a local filename takes part in synchronization
    pub(super) fn accepts(&self, filename: &str) -> bool {
        is_plain_filename(filename)
            && !filename.starts_with('.')
            && !self.ignore.iter().any(|pattern| pattern.is_match(filename))
    }

    pub(super) async fn rescan(&self, filename: &str) -> Result<LocalChange, DriveError<I::Error>> {
        if !self.accepts(filename) {
            return Ok(LocalChange::Ignored);
        }
        // busy covers incoming: any fetch may be touching the directory
        if self.inflight.is_busy() {
            tracing::trace!("suppressing local change to {} during transfer", filename);
            return Ok(LocalChange::Suppressed);
        }

        let path = self.drive_path.join(filename);
        match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_file() => self.index_file(filename, &path).await,
            Ok(_) => Ok(LocalChange::Ignored),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.unindex_file(filename).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn index_file(
        &self,
        filename: &str,
        path: &Path,
    ) -> Result<LocalChange, DriveError<I::Error>> {
        let (hash, size) = match ContentHasher::hash_file(path).await {
            Ok(hashed) => hashed,
            // removed between the stat and the read
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.unindex_file(filename).await
            }
            Err(e) => return Err(e.into()),
        };

        let _guard = self.write_lock.lock().await;
        if let Some(IndexValue::Name(NameEntry::Live { hash: current })) =
            self.index.value(filename).await?
        {
            if current == hash {
                return Ok(LocalChange::Unchanged);
            }
        }

        // name first: a reconciler that sees the content row can always
        //  find the name pointing at it
        self.index
            .put(filename, IndexValue::Name(NameEntry::Live { hash }))
            .await?;
        let record = FileRecord {
            filename: filename.to_string(),
            hash,
            path: ROOT_PATH.to_string(),
            size,
            updated_by: self.swarm.identity(),
        };
        self.index
            .put(&hash.to_hex(), IndexValue::Content(ContentEntry::Live(record)))
            .await?;
        tracing::debug!("indexed {} ({} bytes, {})", filename, size, hash);
        Ok(LocalChange::Indexed(hash))
    }

    async fn unindex_file(&self, filename: &str) -> Result<LocalChange, DriveError<I::Error>> {
        let _guard = self.write_lock.lock().await;
        let Some(IndexValue::Name(NameEntry::Live { hash })) = self.index.value(filename).await?
        else {
            return Ok(LocalChange::Unchanged);
        };

        self.index
            .put(
                filename,
                IndexValue::Name(NameEntry::Deleted {
                    filename: filename.to_string(),
                    path: ROOT_PATH.to_string(),
                }),
            )
            .await?;
        // the bytes may still be live under another name
        let content = match self.surviving_name(&hash, filename).await? {
            Some(survivor) => {
                let record = self.content_record(&hash, &survivor).await?;
                tracing::debug!("{} still holds {}", survivor, hash);
                ContentEntry::Live(record)
            }
            None => ContentEntry::Deleted,
        };
        self.index
            .put(&hash.to_hex(), IndexValue::Content(content))
            .await?;
        tracing::debug!("unindexed {} ({})", filename, hash);
        Ok(LocalChange::Removed(hash))
    }

    /// Another filename whose current name row still points at `hash`
    async fn surviving_name(
        &self,
        hash: &ContentHash,
        removed: &str,
    ) -> Result<Option<String>, DriveError<I::Error>> {
        let mut candidates: Vec<String> = self
            .index
            .history(HistoryOptions::default())?
            .filter_map(|entry| async move {
                match entry.value {
                    Some(IndexValue::Name(NameEntry::Live { hash: named }))
                        if &named == hash && entry.key != removed =>
                    {
                        Some(entry.key)
                    }
                    _ => None,
                }
            })
            .collect()
            .await;
        candidates.sort();
        candidates.dedup();

        for candidate in candidates {
            if let Some(IndexValue::Name(NameEntry::Live { hash: current })) =
                self.index.value(&candidate).await?
            {
                if &current == hash {
                    return Ok(Some(candidate));
                }
            }
        }
        Ok(None)
    }

    /// Content row for `hash` rewritten to point at `filename`
    async fn content_record(
        &self,
        hash: &ContentHash,
        filename: &str,
    ) -> Result<FileRecord, DriveError<I::Error>> {
        if let Some(IndexValue::Content(ContentEntry::Live(record))) =
            self.index.value(&hash.to_hex()).await?
        {
            return Ok(FileRecord {
                filename: filename.to_string(),
                ..record
            });
        }
        let size = tokio::fs::metadata(self.drive_path.join(filename)).await?.len();
        Ok(FileRecord {
            filename: filename.to_string(),
            hash: *hash,
            path: ROOT_PATH.to_string(),
            size,
            updated_by: self.swarm.identity(),
        })
    }

    /// Rescan every top-level entry of the drive directory, in name order
    pub(super) async fn scan_existing(
        &self,
    ) -> Result<Vec<(String, LocalChange)>, DriveError<I::Error>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.drive_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path() == self.meta_path {
                continue;
            }
            // non-utf8 names cannot be index keys
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();

        let mut changes = Vec::with_capacity(names.len());
        for name in names {
            let change = self.rescan(&name).await?;
            changes.push((name, change));
        }
        Ok(changes)
    }

    /// Top-level filename a watcher event path refers to, if any
    fn event_filename(&self, path: &Path, canonical_root: &Path) -> Option<String> {
        let parent = path.parent()?;
        if parent != self.drive_path && parent != canonical_root {
            return None;
        }
        path.file_name()?.to_str().map(str::to_string)
    }

    /// Watch the drive directory and feed every change through `rescan`.
    ///
    /// Starts with a full scan so changes made while the drive was closed
    ///  are picked up.
    pub(super) fn start_watcher(self: &Arc<Self>) -> Result<(), DriveError<I::Error>> {
        let (events_tx, events_rx) = flume::unbounded::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |result| {
                if events_tx.send(result).is_err() {
                    tracing::trace!("watcher event dropped, drive is closing");
                }
            },
            Config::default(),
        )?;
        watcher.watch(&self.drive_path, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);

        let handle = tokio::spawn(watch_loop(
            self.clone(),
            events_rx,
            self.shutdown.subscribe(),
        ));
        self.track_task(handle);
        Ok(())
    }
}

async fn watch_loop<I: IndexProvider>(
    inner: Arc<DriveInner<I>>,
    events: flume::Receiver<notify::Result<Event>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = inner.scan_existing().await {
        tracing::warn!("initial scan of {} failed: {}", inner.drive_path.display(), e);
    }
    let canonical_root = tokio::fs::canonicalize(&inner.drive_path)
        .await
        .unwrap_or_else(|_| inner.drive_path.clone());

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv_async() => match event {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    tracing::warn!("watcher error: {}", e);
                    continue;
                }
                Err(_) => break,
            },
        };
        if matches!(event.kind, EventKind::Access(_)) {
            continue;
        }

        for path in &event.paths {
            let Some(filename) = inner.event_filename(path, &canonical_root) else {
                continue;
            };
            match inner.rescan(&filename).await {
                Ok(LocalChange::Indexed(hash)) => {
                    tracing::info!("local change: {} is now {}", filename, hash)
                }
                Ok(LocalChange::Removed(_)) => tracing::info!("local change: {} removed", filename),
                Ok(_) => {}
                Err(e) => tracing::warn!("failed to index {}: {}", filename, e),
            }
        }
    }
}
