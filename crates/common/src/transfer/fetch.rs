use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{FileRequest, TransferError};
use crate::crypto::{ContentHash, ContentHasher, PublicKey};
use crate::swarm::{BoxedPeerStream, JoinOptions, Swarm, SwarmError, SwarmSession};
use crate::wire::write_frame;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// How long to wait for the serving peer to show up
    pub connect_timeout: Duration,
    /// Bound on the peer refresh before the single retry
    pub refresh_timeout: Duration,
    /// Refuse bytes whose digest differs from the requested hash
    pub verify: bool,
    /// Where partial downloads are staged before being moved into place
    pub staging_dir: PathBuf,
}

/// A completed fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub size: u64,
    /// Digest of what was actually received
    pub hash: ContentHash,
    /// Whether a file of that name existed before it was replaced
    pub existed: bool,
    /// Peer that served the bytes
    pub served_by: PublicKey,
}

/// Fetch `hash` from `target` and install it as `destination`.
///
/// If `target` cannot be reached within the connect timeout, the
///  replication session is asked for a fresh peer and the fetch is retried
///  once against whoever turns up.
pub async fn fetch_file<T>(
    swarm: &dyn Swarm,
    replication: Option<&SwarmSession>,
    target: PublicKey,
    hash: ContentHash,
    destination: &Path,
    options: &FetchOptions,
) -> Result<FetchedFile, TransferError<T>> {
    let (peer, stream) = match connect(swarm, target, options.connect_timeout).await? {
        Some(found) => found,
        None => {
            let Some(replication) = replication else {
                return Err(TransferError::PeerUnreachable(target));
            };
            tracing::debug!(
                "{} unreachable, refreshing peers before retrying",
                target.fmt_short()
            );
            let alternate = match replication.refresh_peers(options.refresh_timeout).await {
                Ok(peer) => peer,
                Err(SwarmError::Timeout) => return Err(TransferError::PeerUnreachable(target)),
                Err(e) => return Err(e.into()),
            };
            connect(swarm, alternate, options.connect_timeout)
                .await?
                .ok_or(TransferError::PeerUnreachable(target))?
        }
    };
    receive(swarm.identity(), peer, stream, hash, destination, options).await
}

/// Join `target`'s own topic and wait for a connection that isn't us.
///
/// The throwaway session is left again before returning; the stream it
///  produced stays usable.
async fn connect(
    swarm: &dyn Swarm,
    target: PublicKey,
    timeout: Duration,
) -> Result<Option<(PublicKey, BoxedPeerStream)>, SwarmError> {
    let session = swarm
        .join(target.discovery_key(), JoinOptions::lookup())
        .await?;
    let me = swarm.identity();
    let wait = async {
        while let Some(connection) = session.accept().await {
            if connection.peer == me {
                tracing::trace!("dropping self-connection on {:?}", session.topic());
                continue;
            }
            return Some((connection.peer, connection.stream));
        }
        None
    };
    let found = tokio::time::timeout(timeout, wait).await.ok().flatten();
    session.close().await?;
    Ok(found)
}

async fn receive<T>(
    me: PublicKey,
    peer: PublicKey,
    mut stream: BoxedPeerStream,
    hash: ContentHash,
    destination: &Path,
    options: &FetchOptions,
) -> Result<FetchedFile, TransferError<T>> {
    write_frame(
        &mut stream,
        &FileRequest {
            file_hash: hash,
            requester: me,
        },
    )
    .await?;

    tokio::fs::create_dir_all(&options.staging_dir).await?;
    let (staged, staged_path) = tempfile::Builder::new()
        .prefix(&format!("{}-", hash.to_hex()))
        .tempfile_in(&options.staging_dir)?
        .into_parts();
    let mut staged = tokio::fs::File::from_std(staged);

    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        staged.write_all(&buf[..n]).await?;
        size += n as u64;
    }
    staged.flush().await?;
    staged.sync_all().await?;
    drop(staged);

    let actual = hasher.finalize();
    if size == 0 && hash != ContentHash::of(b"") {
        return Err(TransferError::Declined(peer));
    }
    if options.verify && actual != hash {
        tracing::warn!(
            "{} sent {} bytes hashing to {}, expected {}",
            peer.fmt_short(),
            size,
            actual,
            hash
        );
        // staging file is removed when `staged_path` drops
        return Err(TransferError::HashMismatch {
            expected: hash,
            actual,
        });
    }

    let existed = tokio::fs::try_exists(destination).await?;
    staged_path
        .persist(destination)
        .map_err(|e| TransferError::Io(e.error))?;
    tracing::debug!(
        "received {} bytes from {} into {}",
        size,
        peer.fmt_short(),
        destination.display()
    );

    Ok(FetchedFile {
        path: destination.to_path_buf(),
        size,
        hash: actual,
        existed,
        served_by: peer,
    })
}
