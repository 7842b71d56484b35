use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::entry::{IndexEntry, IndexValue};
use crate::crypto::PublicKey;
use crate::swarm::BoxedPeerStream;
use crate::wire::FrameError;

#[derive(thiserror::Error, Debug)]
pub enum IndexError<T> {
    /// Unhandled error from the backing store
    #[error("unhandled index provider error: {0}")]
    Provider(#[from] T),
    /// The index handle has been closed
    #[error("index is closed")]
    Closed,
    /// The replication stream broke or carried garbage
    #[error("replication error: {0}")]
    Replication(FrameError),
}

/// Where and how to read the change history
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryOptions {
    /// Keep the stream open and yield entries as they are applied
    pub live: bool,
    /// Position in the applied history to start from
    pub from: usize,
}

/// The replicated, multi-writer key/value log a drive keeps its metadata in.
///
/// Implementations own merge and admission: rows authored by a feed that has
///  not been admitted through [`IndexProvider::add_writers`] must never become
///  visible through `get` or `history`.
#[async_trait]
pub trait IndexProvider: Send + Sync + Debug + Clone + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Key of this replica's own feed (the "diff key")
    fn local_writer(&self) -> PublicKey;

    /// Latest visible row for a key, `None` if absent or deleted
    async fn get(&self, key: &str) -> Result<Option<IndexEntry>, IndexError<Self::Error>>;

    async fn put(&self, key: &str, value: IndexValue) -> Result<(), IndexError<Self::Error>>;

    async fn del(&self, key: &str) -> Result<(), IndexError<Self::Error>>;

    /// Applied rows in application order.
    ///
    /// Restartable from any position; never terminates while `live` is set
    ///  and the index is open.
    fn history(
        &self,
        options: HistoryOptions,
    ) -> Result<BoxStream<'static, IndexEntry>, IndexError<Self::Error>>;

    /// Admit feeds whose rows should be merged into this replica
    async fn add_writers(&self, writers: &[PublicKey]) -> Result<(), IndexError<Self::Error>>;

    /// Register a peer we replicate with. Read-only replication needs no
    ///  admission, this only records the relationship.
    async fn add_replica(&self, peer: PublicKey) -> Result<(), IndexError<Self::Error>>;

    /// Exchange rows with a remote replica until either side hangs up
    async fn replicate(
        &self,
        initiator: bool,
        stream: BoxedPeerStream,
    ) -> Result<(), IndexError<Self::Error>>;

    async fn close(&self) -> Result<(), IndexError<Self::Error>>;

    /// Value of the latest visible row for a key
    async fn value(&self, key: &str) -> Result<Option<IndexValue>, IndexError<Self::Error>> {
        Ok(self.get(key).await?.and_then(|entry| entry.value))
    }
}
