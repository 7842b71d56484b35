use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use super::drive::TestDrive;
use crate::access::Role;
use crate::crypto::PublicKey;
use crate::drive::{Drive, DriveBuilder, DriveConfig};
use crate::index::MemoryIndex;
use crate::swarm::MemoryNetwork;

/// A shared in-memory network that test drives join
///
/// Every drive gets its own temporary directory, a persisted identity under
/// its meta dir, and an index whose local feed is that identity.
#[derive(Debug, Clone, Default)]
pub struct TestNetwork {
    network: MemoryNetwork,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
        }
    }

    /// The underlying network, for connection accounting
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    /// Config with short delays and timeouts, so failing tests fail fast
    pub fn fast_config() -> DriveConfig {
        DriveConfig {
            connect_timeout_ms: 1000,
            refresh_timeout_ms: 1000,
            settle_delay_ms: 50,
            close_timeout_ms: 2000,
            ..DriveConfig::default()
        }
    }

    /// Build a drive in a fresh directory, without calling `ready()`
    ///
    /// `configure` gets a builder preset with `watch(false)` and
    /// [`Self::fast_config`].
    pub async fn drive<F>(&self, name: impl Into<String>, configure: F) -> Result<TestDrive>
    where
        F: FnOnce(DriveBuilder) -> DriveBuilder,
    {
        self.drive_in(name, TempDir::new()?, configure).await
    }

    /// Like [`Self::drive`], in an existing directory
    pub async fn drive_in<F>(
        &self,
        name: impl Into<String>,
        dir: TempDir,
        configure: F,
    ) -> Result<TestDrive>
    where
        F: FnOnce(DriveBuilder) -> DriveBuilder,
    {
        let name = name.into();
        let builder = configure(
            Drive::<MemoryIndex>::builder(dir.path())
                .watch(false)
                .config(Self::fast_config()),
        );
        let identity = builder.identity().await?.public();
        let drive = builder
            .build(
                MemoryIndex::new(identity),
                Arc::new(self.network.swarm(identity)),
            )
            .await?;
        tracing::debug!("created test drive {} as {}", name, identity.fmt_short());
        Ok(TestDrive::new(name, drive, dir))
    }

    /// A ready owner drive, bootstrapped over `files`
    pub async fn owner(&self, name: impl Into<String>, files: &[(&str, &[u8])]) -> Result<TestDrive> {
        let dir = TempDir::new()?;
        for (filename, contents) in files {
            tokio::fs::write(dir.path().join(filename), contents).await?;
        }
        let owner = self.drive_in(name, dir, |builder| builder).await?;
        owner.drive.ready().await?;
        Ok(owner)
    }

    /// A ready reader-only drive joining `public_key`
    pub async fn reader(&self, name: impl Into<String>, public_key: PublicKey) -> Result<TestDrive> {
        let reader = self
            .drive(name, |builder| {
                builder.role(Role::ReaderOnly).public_key(public_key)
            })
            .await?;
        reader.drive.ready().await?;
        Ok(reader)
    }

    /// Poll a condition until it succeeds or times out
    ///
    /// This is useful for testing eventual consistency across drives.
    ///
    /// # Example
    /// ```rust,ignore
    /// net.eventually(Duration::from_secs(5), || async {
    ///     Ok(bob.read("test.txt").await.is_some())
    /// }).await?;
    /// ```
    pub async fn eventually<F, Fut>(&self, timeout: Duration, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(25);

        loop {
            match condition().await {
                Ok(true) => {
                    tracing::debug!("Eventual condition met after {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    // transient errors are expected while drives converge
                    tracing::debug!("Eventual condition check error: {}", e);
                }
            }

            if start.elapsed() > timeout {
                return Err(anyhow::anyhow!(
                    "Condition not met within timeout ({:?})",
                    timeout
                ));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
