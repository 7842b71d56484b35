//! Integration tests for filesystem watching

mod common;

use std::time::Duration;

use ::common::access::{PeerGrant, Role};
use ::common::crypto::ContentHash;
use ::common::index::{HistoryOptions, IndexProvider, IndexValue, NameEntry};
use ::common::testkit::TestNetwork;
use common::{init_tracing, SYNC_TIMEOUT};
use futures::StreamExt;

/// Native watcher backends can be slow to deliver on loaded machines
const WATCH_TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn test_watcher_indexes_local_changes() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let alice = net.drive("alice", |builder| builder.watch(true)).await?;
    alice.drive.ready().await?;

    tokio::fs::write(alice.file_path("notes.md"), b"draft").await?;
    let written = Some(IndexValue::Name(NameEntry::Live {
        hash: ContentHash::of(b"draft"),
    }));
    {
        let (alice, written) = (&alice, &written);
        net.eventually(WATCH_TIMEOUT, || async move {
            Ok(&alice.drive.index().value("notes.md").await? == written)
        })
        .await?;
    }

    tokio::fs::remove_file(alice.file_path("notes.md")).await?;
    {
        let alice = &alice;
        net.eventually(WATCH_TIMEOUT, || async move {
            Ok(matches!(
                alice.drive.index().value("notes.md").await?,
                Some(IndexValue::Name(NameEntry::Deleted { .. }))
            ))
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_watcher_picks_up_files_written_while_closed() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let alice = net.owner("alice", &[]).await?;
    let public_key = alice.public_key();
    let dir = alice.close().await?;
    std::fs::write(dir.path().join("offline.txt"), b"written offline")?;

    let reopened = net
        .drive_in("alice", dir, |builder| {
            builder.public_key(public_key).watch(true)
        })
        .await?;
    reopened.drive.ready().await?;
    {
        let reopened = &reopened;
        net.eventually(WATCH_TIMEOUT, || async move {
            Ok(reopened.drive.index().value("offline.txt").await?.is_some())
        })
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_watching_reader_does_not_reindex_fetched_files() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let alice = net.owner("alice", &[("notes.md", b"draft")]).await?;
    let bob = net
        .drive("bob", |builder| {
            builder
                .role(Role::ReaderOnly)
                .public_key(alice.public_key())
                .watch(true)
        })
        .await?;
    bob.drive.ready().await?;
    bob.drive
        .add_peer(PeerGrant::writer(alice.drive.diff_key()))
        .await?;

    {
        let bob = &bob;
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.read("notes.md").await.as_deref() == Some(&b"draft"[..])
                && bob.drive.incoming().is_empty())
        })
        .await?;
    }
    // give the watcher time to deliver the write
    tokio::time::sleep(Duration::from_millis(500)).await;

    let name = bob
        .drive
        .index()
        .get("notes.md")
        .await?
        .expect("name row replicated");
    assert_eq!(name.writer, alice.drive.diff_key());
    assert_eq!(
        name.value,
        Some(IndexValue::Name(NameEntry::Live {
            hash: ContentHash::of(b"draft"),
        }))
    );

    let authored = bob
        .drive
        .index()
        .history(HistoryOptions::default())?
        .filter(|entry| futures::future::ready(entry.writer == bob.drive.diff_key()))
        .count()
        .await;
    assert_eq!(authored, 0);
    Ok(())
}
