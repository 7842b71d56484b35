//! Shared test utilities for drive integration tests
#![allow(dead_code)]

use std::time::Duration;

use ::common::access::PeerGrant;
use ::common::testkit::{TestDrive, TestNetwork};

/// Generous bound for anything that crosses the in-memory network
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "common=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// An owner bootstrapped over `files`, and a reader-only drive that has
/// admitted the owner's feed, converged on its contents and finished
/// every fetch.
pub async fn converged_pair(
    net: &TestNetwork,
    files: &[(&str, &[u8])],
) -> anyhow::Result<(TestDrive, TestDrive)> {
    let alice = net.owner("alice", files).await?;
    let bob = net.reader("bob", alice.public_key()).await?;
    bob.drive
        .add_peer(PeerGrant::writer(alice.drive.diff_key()))
        .await?;

    for (filename, contents) in files {
        let bob = &bob;
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.read(filename).await.as_deref() == Some(*contents))
        })
        .await?;
    }
    // bytes land before the fetch lets go of the filename
    {
        let bob = &bob;
        net.eventually(SYNC_TIMEOUT, || async move {
            Ok(bob.drive.incoming().is_empty())
        })
        .await?;
    }
    Ok((alice, bob))
}
