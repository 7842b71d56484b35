use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::entry::{IndexEntry, IndexValue};
use super::provider::{HistoryOptions, IndexError, IndexProvider};
use crate::crypto::PublicKey;
use crate::swarm::BoxedPeerStream;
use crate::wire::{read_frame, write_frame, FrameError};

/// In-memory multi-writer index.
///
/// Every replica keeps one append-only feed per writer key. Rows from its own
///  feed and from admitted feeds are applied, in arrival order, to a single
///  history; rows from feeds that have not been admitted are held until
///  [`IndexProvider::add_writers`] admits their author. Replication swaps feed
///  records over any duplex byte stream and forwards whatever it learns to
///  every other open replication, so rows travel transitively.
#[derive(Debug, Clone)]
pub struct MemoryIndex {
    inner: Arc<Mutex<MemoryIndexInner>>,
}

#[derive(Debug)]
struct MemoryIndexInner {
    local: PublicKey,
    closed: bool,
    feeds: HashMap<PublicKey, Feed>,
    admitted: BTreeSet<PublicKey>,
    replicas: BTreeSet<PublicKey>,
    /// Applied rows, in application order
    history: Vec<IndexEntry>,
    /// key -> position of its latest row in `history`
    latest: HashMap<String, usize>,
    history_subscribers: Vec<flume::Sender<IndexEntry>>,
    record_subscribers: Vec<flume::Sender<FeedBatch>>,
}

#[derive(Debug, Default)]
struct Feed {
    records: BTreeMap<u64, FeedRecord>,
    /// Next sequence number to apply
    applied: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeedRecord {
    seq: u64,
    key: String,
    value: Option<IndexValue>,
}

/// One replication frame: consecutive records of a single feed
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FeedBatch {
    writer: PublicKey,
    records: Vec<FeedRecord>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryIndexError {
    #[error("memory index error: {0}")]
    Internal(String),
}

impl MemoryIndex {
    /// Open an empty index whose local feed is `local`
    pub fn new(local: PublicKey) -> Self {
        let mut admitted = BTreeSet::new();
        admitted.insert(local);
        Self {
            inner: Arc::new(Mutex::new(MemoryIndexInner {
                local,
                closed: false,
                feeds: HashMap::new(),
                admitted,
                replicas: BTreeSet::new(),
                history: Vec::new(),
                latest: HashMap::new(),
                history_subscribers: Vec::new(),
                record_subscribers: Vec::new(),
            })),
        }
    }

    /// Feeds whose rows this replica applies
    pub fn writers(&self) -> Vec<PublicKey> {
        self.inner.lock().admitted.iter().copied().collect()
    }

    /// Peers registered through `add_replica`
    pub fn replicas(&self) -> Vec<PublicKey> {
        self.inner.lock().replicas.iter().copied().collect()
    }

    /// Rows held back because their feed has not been admitted
    pub fn pending(&self, writer: &PublicKey) -> usize {
        let inner = self.inner.lock();
        inner
            .feeds
            .get(writer)
            .map(|feed| feed.records.len() - feed.applied as usize)
            .unwrap_or(0)
    }

    /// Number of applied rows
    pub fn len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_local(
        &self,
        key: &str,
        value: Option<IndexValue>,
    ) -> Result<(), IndexError<MemoryIndexError>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(IndexError::Closed);
        }
        let local = inner.local;
        let feed = inner.feeds.entry(local).or_default();
        let seq = feed.records.len() as u64;
        let record = FeedRecord {
            seq,
            key: key.to_string(),
            value,
        };
        feed.records.insert(seq, record.clone());
        inner.apply_pending(&local);
        inner.forward(FeedBatch {
            writer: local,
            records: vec![record],
        });
        Ok(())
    }

    fn ingest(&self, batch: FeedBatch) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let feed = inner.feeds.entry(batch.writer).or_default();
        let mut fresh = Vec::new();
        for record in batch.records {
            if record.seq < feed.applied || feed.records.contains_key(&record.seq) {
                continue;
            }
            feed.records.insert(record.seq, record.clone());
            fresh.push(record);
        }
        if fresh.is_empty() {
            return;
        }
        tracing::trace!(
            "index {}: received {} record(s) from feed {}",
            inner.local.fmt_short(),
            fresh.len(),
            batch.writer.fmt_short()
        );
        if inner.admitted.contains(&batch.writer) {
            inner.apply_pending(&batch.writer);
        }
        inner.forward(FeedBatch {
            writer: batch.writer,
            records: fresh,
        });
    }
}

impl MemoryIndexInner {
    /// Apply every contiguous record of an admitted feed
    fn apply_pending(&mut self, writer: &PublicKey) {
        let Some(feed) = self.feeds.get_mut(writer) else {
            return;
        };
        let mut applied = Vec::new();
        while let Some(record) = feed.records.get(&feed.applied) {
            applied.push(IndexEntry {
                key: record.key.clone(),
                value: record.value.clone(),
                writer: *writer,
                seq: record.seq,
            });
            feed.applied += 1;
        }
        for entry in applied {
            self.latest.insert(entry.key.clone(), self.history.len());
            self.history.push(entry.clone());
            self.history_subscribers
                .retain(|tx| tx.send(entry.clone()).is_ok());
        }
    }

    fn forward(&mut self, batch: FeedBatch) {
        self.record_subscribers
            .retain(|tx| tx.send(batch.clone()).is_ok());
    }

    fn snapshot(&self) -> Vec<FeedBatch> {
        self.feeds
            .iter()
            .filter(|(_, feed)| !feed.records.is_empty())
            .map(|(writer, feed)| FeedBatch {
                writer: *writer,
                records: feed.records.values().cloned().collect(),
            })
            .collect()
    }
}

#[async_trait]
impl IndexProvider for MemoryIndex {
    type Error = MemoryIndexError;

    fn local_writer(&self) -> PublicKey {
        self.inner.lock().local
    }

    async fn get(&self, key: &str) -> Result<Option<IndexEntry>, IndexError<Self::Error>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(IndexError::Closed);
        }
        Ok(inner
            .latest
            .get(key)
            .map(|idx| inner.history[*idx].clone())
            .filter(|entry| entry.value.is_some()))
    }

    async fn put(&self, key: &str, value: IndexValue) -> Result<(), IndexError<Self::Error>> {
        self.append_local(key, Some(value))
    }

    async fn del(&self, key: &str) -> Result<(), IndexError<Self::Error>> {
        self.append_local(key, None)
    }

    fn history(
        &self,
        options: HistoryOptions,
    ) -> Result<BoxStream<'static, IndexEntry>, IndexError<Self::Error>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(IndexError::Closed);
        }
        let backlog: Vec<IndexEntry> = inner
            .history
            .get(options.from..)
            .map(|rows| rows.to_vec())
            .unwrap_or_default();
        if !options.live {
            return Ok(stream::iter(backlog).boxed());
        }
        // subscribe under the same lock as the backlog copy so nothing
        //  applied in between is lost or doubled
        let (tx, rx) = flume::unbounded();
        inner.history_subscribers.push(tx);
        Ok(stream::iter(backlog).chain(rx.into_stream()).boxed())
    }

    async fn add_writers(&self, writers: &[PublicKey]) -> Result<(), IndexError<Self::Error>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(IndexError::Closed);
        }
        for writer in writers {
            if inner.admitted.insert(*writer) {
                tracing::debug!(
                    "index {}: admitted writer {}",
                    inner.local.fmt_short(),
                    writer.fmt_short()
                );
                inner.apply_pending(writer);
            }
        }
        Ok(())
    }

    async fn add_replica(&self, peer: PublicKey) -> Result<(), IndexError<Self::Error>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(IndexError::Closed);
        }
        inner.replicas.insert(peer);
        Ok(())
    }

    async fn replicate(
        &self,
        initiator: bool,
        stream: BoxedPeerStream,
    ) -> Result<(), IndexError<Self::Error>> {
        let (snapshot, updates) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(IndexError::Closed);
            }
            let (tx, rx) = flume::unbounded();
            inner.record_subscribers.push(tx);
            (inner.snapshot(), rx)
        };
        tracing::debug!(
            "index {}: replicating (initiator: {}), {} feed(s) to offer",
            self.local_writer().fmt_short(),
            initiator,
            snapshot.len()
        );

        let (mut reader, mut writer) = tokio::io::split(stream);

        let send = async move {
            for batch in snapshot {
                write_frame(&mut writer, &batch).await?;
            }
            // ends when the index closes and drops our sender
            while let Ok(batch) = updates.recv_async().await {
                write_frame(&mut writer, &batch).await?;
            }
            Ok::<(), FrameError>(())
        };

        let receive = async {
            while let Some(batch) = read_frame::<_, FeedBatch>(&mut reader).await? {
                self.ingest(batch);
            }
            Ok::<(), FrameError>(())
        };

        tokio::select! {
            res = send => res.map_err(IndexError::Replication),
            res = receive => res.map_err(IndexError::Replication),
        }
    }

    async fn close(&self) -> Result<(), IndexError<Self::Error>> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.history_subscribers.clear();
        inner.record_subscribers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ContentHash, SecretKey};
    use crate::index::entry::NameEntry;

    fn name(data: &[u8]) -> IndexValue {
        IndexValue::Name(NameEntry::Live {
            hash: ContentHash::of(data),
        })
    }

    async fn wait_for_key(index: &MemoryIndex, key: &str) -> IndexEntry {
        for _ in 0..200 {
            if let Some(entry) = index.get(key).await.unwrap() {
                return entry;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("key {} never replicated", key);
    }

    #[tokio::test]
    async fn test_put_get_del() {
        let local = SecretKey::generate().public();
        let index = MemoryIndex::new(local);

        index.put("a.txt", name(b"a")).await.unwrap();
        let entry = index.get("a.txt").await.unwrap().unwrap();
        assert_eq!(entry.value, Some(name(b"a")));
        assert_eq!(entry.writer, local);
        assert_eq!(entry.seq, 0);

        index.put("a.txt", name(b"b")).await.unwrap();
        assert_eq!(index.value("a.txt").await.unwrap(), Some(name(b"b")));

        index.del("a.txt").await.unwrap();
        assert!(index.get("a.txt").await.unwrap().is_none());
        assert_eq!(index.len(), 3);
    }

    #[tokio::test]
    async fn test_history_restart_and_live() {
        let index = MemoryIndex::new(SecretKey::generate().public());
        index.put("a", name(b"a")).await.unwrap();
        index.put("b", name(b"b")).await.unwrap();

        let replay: Vec<_> = index
            .history(HistoryOptions {
                live: false,
                from: 1,
            })
            .unwrap()
            .collect()
            .await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].key, "b");

        let mut live = index
            .history(HistoryOptions {
                live: true,
                from: 0,
            })
            .unwrap();
        index.put("c", name(b"c")).await.unwrap();

        let keys: Vec<String> = (&mut live).take(3).map(|e| e.key).collect().await;
        assert_eq!(keys, vec!["a", "b", "c"]);

        index.close().await.unwrap();
        assert!(live.next().await.is_none());
        assert!(matches!(index.put("d", name(b"d")).await, Err(IndexError::Closed)));
    }

    #[tokio::test]
    async fn test_unadmitted_writer_is_held_until_admitted() {
        let alice = SecretKey::generate().public();
        let bob = SecretKey::generate().public();
        let a = MemoryIndex::new(alice);
        let b = MemoryIndex::new(bob);

        a.put("test.txt", name(b"hi")).await.unwrap();

        let (left, right) = tokio::io::duplex(64 * 1024);
        let (a2, b2) = (a.clone(), b.clone());
        let ta = tokio::spawn(async move { a2.replicate(true, Box::new(left)).await });
        let tb = tokio::spawn(async move { b2.replicate(false, Box::new(right)).await });

        for _ in 0..200 {
            if b.pending(&alice) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(b.pending(&alice), 1);
        assert!(b.get("test.txt").await.unwrap().is_none());

        b.add_writers(&[alice]).await.unwrap();
        let entry = wait_for_key(&b, "test.txt").await;
        assert_eq!(entry.writer, alice);
        assert_eq!(b.pending(&alice), 0);

        // bob's rows are never admitted on alice's side
        b.put("bob.txt", name(b"bob")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(a.get("bob.txt").await.unwrap().is_none());
        assert!(!a.writers().contains(&bob));

        a.close().await.unwrap();
        b.close().await.unwrap();
        ta.abort();
        tb.abort();
    }

    #[tokio::test]
    async fn test_rows_travel_through_intermediate_replica() {
        let keys: Vec<PublicKey> = (0..3).map(|_| SecretKey::generate().public()).collect();
        let indexes: Vec<MemoryIndex> = keys.iter().map(|k| MemoryIndex::new(*k)).collect();
        for index in &indexes {
            index.add_writers(&keys).await.unwrap();
        }

        let mut tasks = Vec::new();
        for (x, y) in [(0usize, 1usize), (1, 2)] {
            let (left, right) = tokio::io::duplex(64 * 1024);
            let (ix, iy) = (indexes[x].clone(), indexes[y].clone());
            tasks.push(tokio::spawn(async move { ix.replicate(true, Box::new(left)).await }));
            tasks.push(tokio::spawn(async move { iy.replicate(false, Box::new(right)).await }));
        }

        indexes[0].put("far.txt", name(b"far")).await.unwrap();
        let entry = wait_for_key(&indexes[2], "far.txt").await;
        assert_eq!(entry.writer, keys[0]);

        for task in tasks {
            task.abort();
        }
    }
}
