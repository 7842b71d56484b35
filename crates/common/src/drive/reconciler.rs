//! Remote index rows into local fetches and deletes.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;

use super::inflight::TransferTicket;
use super::{DriveError, DriveEvent, DriveInner};
use crate::crypto::{ContentHasher, PublicKey};
use crate::index::{
    AccessRecord, ContentEntry, FileRecord, HistoryOptions, IndexEntry, IndexProvider, IndexValue,
    NameEntry, ACCESS_KEY, PUBLIC_KEY_KEY,
};
use crate::transfer::{fetch_file, FetchOptions};

/// What reconciling one row did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Authored by our own feed
    OwnWrite,
    /// Nothing this drive acts on
    Ignored,
    /// Took the drive key from the index
    Adopted,
    AccessObserved,
    /// A later row for the same filename wins
    Superseded,
    /// Removed the local copy
    Deleted,
    /// Tombstone for a file we never had
    Absent,
    /// The local file already has these bytes
    UpToDate,
    /// Someone is already fetching this filename
    AlreadyIncoming,
    /// A fetch was started
    Fetching,
}

pub(super) async fn run<I: IndexProvider>(
    inner: Arc<DriveInner<I>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut history = match inner.index.history(HistoryOptions {
        live: true,
        from: 0,
    }) {
        Ok(history) => history,
        Err(e) => {
            tracing::error!("cannot follow index history: {}", e);
            return;
        }
    };
    let rechecks = inner.rechecks_rx.clone();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            entry = history.next() => {
                let Some(entry) = entry else { break };
                match inner.reconcile(&entry).await {
                    Ok(outcome) => tracing::trace!("{} -> {:?}", entry.key, outcome),
                    Err(e) => tracing::warn!("failed to reconcile {}: {}", entry.key, e),
                }
            }
            filename = rechecks.recv_async() => {
                let Ok(filename) = filename else { break };
                if let Err(e) = inner.recheck(&filename).await {
                    tracing::warn!("failed to recheck {}: {}", filename, e);
                }
            }
        }
    }
    tracing::debug!("reconciler stopped");
}

impl<I: IndexProvider> DriveInner<I> {
    pub(super) async fn reconcile(
        self: &Arc<Self>,
        entry: &IndexEntry,
    ) -> Result<Reconciled, DriveError<I::Error>> {
        if entry.writer == self.index.local_writer() {
            return Ok(Reconciled::OwnWrite);
        }
        let Some(value) = &entry.value else {
            return Ok(Reconciled::Ignored);
        };

        match (entry.key.as_str(), value) {
            (PUBLIC_KEY_KEY, IndexValue::PublicKey { key }) => Ok(self.adopt_public_key(*key)),
            (ACCESS_KEY, IndexValue::Access(record)) => self.observe_access(record).await,
            (key, IndexValue::Name(NameEntry::Deleted { filename, .. })) if key == filename => {
                self.reconcile_tombstone(filename).await
            }
            (key, IndexValue::Content(ContentEntry::Live(record)))
                if key == record.hash.to_hex() =>
            {
                self.reconcile_content(record).await
            }
            _ => Ok(Reconciled::Ignored),
        }
    }

    /// Re-evaluate a filename from the current index state
    pub(super) async fn recheck(
        self: &Arc<Self>,
        filename: &str,
    ) -> Result<Reconciled, DriveError<I::Error>> {
        match self.index.value(filename).await? {
            Some(IndexValue::Name(NameEntry::Live { hash })) => {
                match self.index.value(&hash.to_hex()).await? {
                    Some(IndexValue::Content(ContentEntry::Live(record))) => {
                        self.reconcile_content(&record).await
                    }
                    _ => Ok(Reconciled::Ignored),
                }
            }
            Some(IndexValue::Name(NameEntry::Deleted { .. })) => {
                self.reconcile_tombstone(filename).await
            }
            _ => Ok(Reconciled::Ignored),
        }
    }

    fn adopt_public_key(&self, key: PublicKey) -> Reconciled {
        let mut public_key = self.public_key.write();
        match *public_key {
            None => {
                *public_key = Some(key);
                tracing::info!("adopted drive key {}", key.fmt_short());
                Reconciled::Adopted
            }
            Some(current) if current == key => Reconciled::UpToDate,
            Some(current) => {
                tracing::warn!(
                    "index carries drive key {}, but this is drive {}",
                    key.fmt_short(),
                    current.fmt_short()
                );
                Reconciled::Ignored
            }
        }
    }

    async fn observe_access(
        &self,
        record: &AccessRecord,
    ) -> Result<Reconciled, DriveError<I::Error>> {
        self.access.observe(record).await?;
        Ok(Reconciled::AccessObserved)
    }

    async fn reconcile_tombstone(&self, filename: &str) -> Result<Reconciled, DriveError<I::Error>> {
        if !self.accepts(filename) {
            return Ok(Reconciled::Ignored);
        }
        // a re-add after the tombstone wins
        if !matches!(
            self.index.value(filename).await?,
            Some(IndexValue::Name(NameEntry::Deleted { .. }))
        ) {
            return Ok(Reconciled::Superseded);
        }
        // the fetch rechecks once it lands
        if self.inflight.is_incoming(filename) {
            return Ok(Reconciled::AlreadyIncoming);
        }

        let path = self.drive_path.join(filename);
        let removed = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => {
                tracing::info!("removed {} (deleted remotely)", filename);
                self.emit(DriveEvent::FileUnlink {
                    filename: filename.to_string(),
                    path,
                });
                Ok(Reconciled::Deleted)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Reconciled::Absent),
            Err(e) => Err(e.into()),
        }
    }

    async fn reconcile_content(
        self: &Arc<Self>,
        record: &FileRecord,
    ) -> Result<Reconciled, DriveError<I::Error>> {
        if !self.accepts(&record.filename) {
            return Ok(Reconciled::Ignored);
        }
        match self.index.value(&record.filename).await? {
            Some(IndexValue::Name(NameEntry::Live { hash })) if hash == record.hash => {}
            _ => return Ok(Reconciled::Superseded),
        }
        if self.inflight.is_incoming(&record.filename) {
            return Ok(Reconciled::AlreadyIncoming);
        }

        let path = self.drive_path.join(&record.filename);
        match ContentHasher::hash_file(&path).await {
            Ok((local, _)) if local == record.hash => return Ok(Reconciled::UpToDate),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if record.updated_by == self.swarm.identity() {
            // we indexed these bytes ourselves; nobody else to ask
            return Ok(Reconciled::OwnWrite);
        }

        let Some(ticket) = self.inflight.try_begin(&record.filename) else {
            return Ok(Reconciled::AlreadyIncoming);
        };
        tracing::info!(
            "fetching {} ({}) from {}",
            record.filename,
            record.hash,
            record.updated_by.fmt_short()
        );
        let handle = tokio::spawn(fetch_task(self.clone(), record.clone(), ticket));
        self.track_worker(handle);
        Ok(Reconciled::Fetching)
    }
}

async fn fetch_task<I: IndexProvider>(
    inner: Arc<DriveInner<I>>,
    record: FileRecord,
    ticket: TransferTicket,
) {
    let destination = inner.drive_path.join(&record.filename);
    let options = FetchOptions {
        connect_timeout: inner.config.connect_timeout(),
        refresh_timeout: inner.config.refresh_timeout(),
        verify: inner.config.verify_transfers,
        staging_dir: inner.staging_path.clone(),
    };
    let replication = inner.replication.lock().clone();

    let fetched = fetch_file::<I::Error>(
        inner.swarm.as_ref(),
        replication.as_deref(),
        record.updated_by,
        record.hash,
        &destination,
        &options,
    )
    .await;

    match fetched {
        Ok(fetched) => {
            // let watcher echoes of the write arrive while still suppressed
            tokio::time::sleep(inner.config.settle_delay()).await;
            tracing::info!(
                "fetched {} ({} bytes) from {}",
                record.filename,
                fetched.size,
                fetched.served_by.fmt_short()
            );
            let event = if fetched.existed {
                DriveEvent::FileUpdate {
                    filename: record.filename.clone(),
                    path: fetched.path,
                }
            } else {
                DriveEvent::FileAdd {
                    filename: record.filename.clone(),
                    path: fetched.path,
                }
            };
            // announced before the filename is released
            inner.emit(event);
            drop(ticket);
            // the index may have moved on while we were downloading
            let _ = inner.rechecks_tx.send(record.filename);
        }
        Err(e) => {
            tracing::warn!("failed to fetch {}: {}", record.filename, e);
            inner.emit(DriveEvent::FetchFailed {
                filename: record.filename.clone(),
                error: e.to_string(),
            });
            drop(ticket);
        }
    }
}
