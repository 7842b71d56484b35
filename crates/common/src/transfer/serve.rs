use std::path::Path;

use tokio::io::AsyncWriteExt;

use super::{FileRequest, TransferError};
use crate::index::{is_plain_filename, ContentEntry, IndexProvider, IndexValue};
use crate::swarm::PeerConnection;
use crate::wire::read_frame;

/// Answer one inbound file request.
///
/// Reads the request frame, looks the hash up in the index and pumps the
///  file's bytes back. On any decline the connection is simply dropped, so
///  the requester sees a stream that ends before any bytes arrived.
pub async fn serve_connection<I: IndexProvider>(
    index: &I,
    drive_path: &Path,
    connection: PeerConnection,
) -> Result<u64, TransferError<I::Error>> {
    let PeerConnection {
        peer, mut stream, ..
    } = connection;

    let request: FileRequest = read_frame(&mut stream)
        .await?
        .ok_or(TransferError::EmptyRequest)?;
    tracing::debug!(
        "file request for {} from {} (connection from {})",
        request.file_hash,
        request.requester.fmt_short(),
        peer.fmt_short()
    );

    let record = match index.value(&request.file_hash.to_hex()).await? {
        Some(IndexValue::Content(ContentEntry::Live(record)))
            if is_plain_filename(&record.filename) =>
        {
            record
        }
        _ => return Err(TransferError::MissingIndexEntry(request.file_hash)),
    };

    let path = drive_path.join(&record.filename);
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::MissingLocalFile(path))
        }
        Err(e) => return Err(e.into()),
    };

    let sent = tokio::io::copy(&mut file, &mut stream).await?;
    stream.shutdown().await?;
    tracing::debug!(
        "served {} ({} bytes) to {}",
        record.filename,
        sent,
        request.requester.fmt_short()
    );
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::crypto::{ContentHash, PublicKey, SecretKey};
    use crate::index::{FileRecord, MemoryIndex, ROOT_PATH};
    use crate::wire::write_frame;

    fn connection(stream: tokio::io::DuplexStream, peer: PublicKey) -> PeerConnection {
        PeerConnection {
            peer,
            initiator: false,
            stream: Box::new(stream),
        }
    }

    async fn request(
        index: &MemoryIndex,
        dir: &Path,
        hash: ContentHash,
    ) -> (Result<u64, TransferError<crate::index::MemoryIndexError>>, Vec<u8>) {
        let requester = SecretKey::generate().public();
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        write_frame(
            &mut client,
            &FileRequest {
                file_hash: hash,
                requester,
            },
        )
        .await
        .unwrap();

        let res = serve_connection(index, dir, connection(server, requester)).await;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        (res, received)
    }

    #[tokio::test]
    async fn test_serves_indexed_file() {
        let dir = tempfile::tempdir().unwrap();
        let me = SecretKey::generate().public();
        let index = MemoryIndex::new(me);
        std::fs::write(dir.path().join("test.txt"), b"hi").unwrap();
        let hash = ContentHash::of(b"hi");
        index
            .put(
                &hash.to_hex(),
                IndexValue::Content(ContentEntry::Live(FileRecord {
                    filename: "test.txt".into(),
                    hash,
                    path: ROOT_PATH.into(),
                    size: 2,
                    updated_by: me,
                })),
            )
            .await
            .unwrap();

        let (res, received) = request(&index, dir.path(), hash).await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(received, b"hi");
    }

    #[tokio::test]
    async fn test_declines_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let index = MemoryIndex::new(SecretKey::generate().public());

        let (res, received) = request(&index, dir.path(), ContentHash::of(b"nope")).await;
        assert!(matches!(res, Err(TransferError::MissingIndexEntry(_))));
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_declines_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let me = SecretKey::generate().public();
        let index = MemoryIndex::new(me);
        let hash = ContentHash::of(b"gone");
        index
            .put(
                &hash.to_hex(),
                IndexValue::Content(ContentEntry::Live(FileRecord {
                    filename: "gone.txt".into(),
                    hash,
                    path: ROOT_PATH.into(),
                    size: 4,
                    updated_by: me,
                })),
            )
            .await
            .unwrap();

        let (res, received) = request(&index, dir.path(), hash).await;
        assert!(matches!(res, Err(TransferError::MissingLocalFile(_))));
        assert!(received.is_empty());
    }
}
