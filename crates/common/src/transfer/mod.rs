//! File request/transfer protocol.
//!
//! A fetch runs over a throwaway swarm session on the serving peer's own
//!  topic (the hash of its identity), never over a replication connection.
//!  The requester sends one [`FileRequest`] frame; the server answers with
//!  the raw file bytes and hangs up. A server that cannot satisfy the request
//!  hangs up without sending anything.

mod fetch;
mod messages;
mod serve;

use std::path::PathBuf;

pub use fetch::{fetch_file, FetchOptions, FetchedFile};
pub use messages::FileRequest;
pub use serve::serve_connection;

use crate::crypto::{ContentHash, PublicKey};
use crate::index::IndexError;
use crate::swarm::SwarmError;
use crate::wire::FrameError;

#[derive(thiserror::Error, Debug)]
pub enum TransferError<T> {
    /// Nobody holding the content answered, even after a peer refresh
    #[error("no reachable peer for {0}")]
    PeerUnreachable(PublicKey),
    /// The serving peer hung up without sending anything
    #[error("{0} declined the request")]
    Declined(PublicKey),
    #[error("no content entry for {0}")]
    MissingIndexEntry(ContentHash),
    #[error("indexed file is missing on disk: {0}")]
    MissingLocalFile(PathBuf),
    #[error("peer sent no request")]
    EmptyRequest,
    #[error("transferred bytes hash to {actual}, expected {expected}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("transfer i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("index error: {0}")]
    Index(#[from] IndexError<T>),
    #[error("swarm error: {0}")]
    Swarm(#[from] SwarmError),
}
