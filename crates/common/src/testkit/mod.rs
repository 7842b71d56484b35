/// Lightweight harness for multi-drive integration tests
///
/// Drives run in temporary directories and find each other over one shared
/// in-memory network, so tests need no sockets or external infrastructure.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::TestNetwork;
///
/// #[tokio::test]
/// async fn test_drive_sync() -> anyhow::Result<()> {
///     let net = TestNetwork::new();
///
///     // Owner bootstraps with one file, reader joins by public key
///     let alice = net.owner("alice", &[("test.txt", b"hi")]).await?;
///     let bob = net.reader("bob", alice.public_key()).await?;
///     bob.drive.add_peer(PeerGrant::writer(alice.drive.diff_key())).await?;
///
///     net.eventually(Duration::from_secs(5), || async {
///         Ok(bob.read("test.txt").await.as_deref() == Some(b"hi".as_slice()))
///     })
///     .await?;
///     Ok(())
/// }
/// ```
mod drive;
mod network;

pub use drive::TestDrive;
pub use network::TestNetwork;
