//! Integration tests for owner -> reader synchronization

mod common;

use std::time::Duration;

use ::common::access::{PeerGrant, Role};
use ::common::crypto::ContentHash;
use ::common::drive::{DriveEvent, LocalChange, Reconciled};
use ::common::index::{IndexProvider, IndexValue, NameEntry};
use ::common::testkit::TestNetwork;
use common::{converged_pair, init_tracing, SYNC_TIMEOUT};
use tokio::sync::broadcast;

/// Wait for the first event matching `filter`
async fn next_event<F>(
    events: &mut broadcast::Receiver<DriveEvent>,
    filter: F,
) -> anyhow::Result<DriveEvent>
where
    F: Fn(&DriveEvent) -> bool,
{
    let wait = async {
        loop {
            let event = events.recv().await?;
            if filter(&event) {
                return anyhow::Ok(event);
            }
        }
    };
    tokio::time::timeout(SYNC_TIMEOUT, wait).await?
}

#[tokio::test]
async fn test_reader_converges_on_owner_files() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let (alice, bob) = converged_pair(&net, &[("test.txt", b"hi")]).await?;

    assert_eq!(alice.drive.size().await?, 2);
    assert_eq!(bob.drive.size().await?, 2);

    let expected = Some(IndexValue::Name(NameEntry::Live {
        hash: ContentHash::of(b"hi"),
    }));
    assert_eq!(alice.drive.index().value("test.txt").await?, expected);
    assert_eq!(bob.drive.index().value("test.txt").await?, expected);

    // nothing left behind in staging
    let staging = bob.drive.meta_path().join("incoming");
    assert_eq!(std::fs::read_dir(staging)?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_owner_delete_unlinks_on_reader() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let (alice, bob) = converged_pair(&net, &[("test.txt", b"hi")]).await?;
    let mut events = bob.drive.subscribe();

    assert_eq!(
        alice.remove("test.txt").await?,
        LocalChange::Removed(ContentHash::of(b"hi"))
    );
    {
        let bob = &bob;
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.read("test.txt").await.is_none())
        })
        .await?;
    }

    let unlink = next_event(&mut events, |e| matches!(e, DriveEvent::FileUnlink { .. })).await?;
    assert_eq!(
        unlink,
        DriveEvent::FileUnlink {
            filename: "test.txt".into(),
            path: bob.file_path("test.txt"),
        }
    );

    // exactly one unlink
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, DriveEvent::FileUnlink { .. }),
            "unexpected second unlink: {:?}",
            event
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_shared_bytes_survive_deleting_one_name() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let alice = net
        .owner("alice", &[("a.txt", b"hi"), ("b.txt", b"hi")])
        .await?;
    let hash = ContentHash::of(b"hi");
    assert_eq!(alice.remove("b.txt").await?, LocalChange::Removed(hash));

    // a reader joining afterwards still gets the surviving copy
    let bob = net.reader("bob", alice.public_key()).await?;
    bob.drive
        .add_peer(PeerGrant::writer(alice.drive.diff_key()))
        .await?;
    {
        let bob = &bob;
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.read("a.txt").await.as_deref() == Some(&b"hi"[..]))
        })
        .await?;
    }
    assert!(bob.read("b.txt").await.is_none());
    assert_eq!(
        bob.drive.index().value("a.txt").await?,
        Some(IndexValue::Name(NameEntry::Live { hash }))
    );
    Ok(())
}

#[tokio::test]
async fn test_readd_after_delete_is_fetched_again() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let (alice, bob) = converged_pair(&net, &[("test.txt", b"hi")]).await?;
    let mut events = bob.drive.subscribe();

    alice.remove("test.txt").await?;
    next_event(&mut events, |e| matches!(e, DriveEvent::FileUnlink { .. })).await?;

    assert!(matches!(
        alice.write("test.txt", b"hello again").await?,
        LocalChange::Indexed(_)
    ));
    let added = next_event(&mut events, |e| {
        matches!(e, DriveEvent::FileAdd { .. } | DriveEvent::FileUpdate { .. })
    })
    .await?;
    assert_eq!(
        added,
        DriveEvent::FileAdd {
            filename: "test.txt".into(),
            path: bob.file_path("test.txt"),
        }
    );
    assert_eq!(bob.read("test.txt").await.as_deref(), Some(&b"hello again"[..]));
    Ok(())
}

#[tokio::test]
async fn test_owner_update_replaces_reader_copy() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let (alice, bob) = converged_pair(&net, &[("test.txt", b"hi")]).await?;

    let mut events = bob.drive.subscribe();
    alice.write("test.txt", b"hi there").await?;
    let updated = next_event(&mut events, |e| e.filename() == Some("test.txt")).await?;
    assert!(
        matches!(updated, DriveEvent::FileUpdate { .. }),
        "got {:?}",
        updated
    );
    assert_eq!(bob.read("test.txt").await.as_deref(), Some(&b"hi there"[..]));
    Ok(())
}

#[tokio::test]
async fn test_replayed_entry_does_not_refetch() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let (alice, bob) = converged_pair(&net, &[("test.txt", b"hi")]).await?;
    let serving_topic = alice.drive.identity().discovery_key();
    assert_eq!(net.network().dials(&serving_topic), 1);

    let hash = ContentHash::of(b"hi");
    let entry = bob
        .drive
        .index()
        .get(&hash.to_hex())
        .await?
        .expect("content row replicated");
    assert_eq!(bob.drive.reconcile(&entry).await?, Reconciled::UpToDate);
    assert_eq!(bob.drive.reconcile(&entry).await?, Reconciled::UpToDate);
    assert_eq!(net.network().dials(&serving_topic), 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_reconcile_fetches_once() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let alice = net.owner("alice", &[("test.txt", b"hi")]).await?;
    // replicates, but leaves reconciling to the test
    let bob = net
        .drive("bob", |builder| {
            builder
                .role(Role::ReaderOnly)
                .public_key(alice.public_key())
                .live(false)
        })
        .await?;
    bob.drive.ready().await?;
    bob.drive
        .add_peer(PeerGrant::writer(alice.drive.diff_key()))
        .await?;

    let key = ContentHash::of(b"hi").to_hex();
    {
        let (bob, key) = (&bob, &key);
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.drive.index().get(key).await?.is_some())
        })
        .await?;
    }
    let entry = bob.drive.index().get(&key).await?.expect("content row");

    let (first, second) = tokio::join!(bob.drive.reconcile(&entry), bob.drive.reconcile(&entry));
    let mut outcomes = vec![first?, second?];
    outcomes.sort_by_key(|outcome| format!("{:?}", outcome));
    assert_eq!(
        outcomes,
        vec![Reconciled::AlreadyIncoming, Reconciled::Fetching]
    );

    {
        let bob = &bob;
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.read("test.txt").await.as_deref() == Some(&b"hi"[..]))
        })
        .await?;
    }
    let serving_topic = alice.drive.identity().discovery_key();
    assert_eq!(net.network().dials(&serving_topic), 1);
    Ok(())
}
