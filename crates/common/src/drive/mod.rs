//! A drive: one peer's binding to a shared, synchronized directory.
//!
//! The drive composes the pieces around a replicated index:
//!
//! - **serving** (`seed`): answers file requests on the drive identity's
//!   own topic, and announces on the drive topic for replication
//! - **reconciling** (`live`): looks up the drive topic, replicates the index
//!   and turns remote rows into local fetches and deletes
//! - **watching** (`watch`): turns local filesystem changes into index rows
//!
//! Loops between the last two are broken by the in-flight set: while any
//!  fetch is running, local events are dropped as echoes of that fetch.

mod config;
mod events;
mod identity;
mod inflight;
mod reconciler;
mod size;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub use config::{ConfigError, DriveConfig, DEFAULT_META_DIR};
pub use events::DriveEvent;
pub use identity::{load_or_create_identity, IdentityError, KEY_FILE_NAME};
pub use reconciler::Reconciled;
pub use size::directory_size;
pub use watcher::LocalChange;

use crate::access::{AccessError, AccessPolicy, PeerGrant, Role};
use crate::crypto::{PublicKey, SecretKey, Topic};
use crate::index::{IndexEntry, IndexError, IndexProvider, IndexValue, PUBLIC_KEY_KEY};
use crate::swarm::{JoinOptions, Swarm, SwarmError, SwarmSession};
use crate::transfer::{serve_connection, TransferError};
use inflight::InFlight;

/// Staging area for inbound transfers, under the meta dir
pub const STAGING_DIR: &str = "incoming";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Uninitialized,
    /// Fresh drive: generating the key and indexing what is on disk
    Bootstrapping,
    /// Joining an existing drive
    Opening,
    Ready,
    Closing,
    Closed,
}

#[derive(thiserror::Error, Debug)]
pub enum DriveError<T> {
    #[error("index error: {0}")]
    Index(#[from] IndexError<T>),
    #[error("access error: {0}")]
    Access(#[from] AccessError<T>),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError<T>),
    #[error("swarm error: {0}")]
    Swarm(#[from] SwarmError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index belongs to drive {found}, expected {expected}")]
    PublicKeyMismatch {
        expected: PublicKey,
        found: PublicKey,
    },
    #[error("operation not valid while {0:?}")]
    InvalidState(DriveState),
}

pub struct DriveBuilder {
    drive_path: PathBuf,
    /// the drive to join; a fresh one is created if unset and the index
    ///  holds none
    public_key: Option<PublicKey>,
    role: Role,
    seed: bool,
    live: bool,
    watch: bool,
    config: DriveConfig,
}

impl DriveBuilder {
    pub fn new(drive_path: impl Into<PathBuf>) -> Self {
        Self {
            drive_path: drive_path.into(),
            public_key: None,
            role: Role::Owner,
            seed: true,
            live: true,
            watch: true,
            config: DriveConfig::default(),
        }
    }

    pub fn public_key(mut self, public_key: PublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn seed(mut self, seed: bool) -> Self {
        self.seed = seed;
        self
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    pub fn config(mut self, config: DriveConfig) -> Self {
        self.config = config;
        self
    }

    /// The drive's sidecar directory
    pub fn meta_path(&self) -> PathBuf {
        self.drive_path.join(&self.config.meta_dir)
    }

    /// The peer identity kept as `key.pem` in the meta dir, generated on
    ///  first use. The swarm passed to [`Self::build`] is expected to run
    ///  under this key.
    pub async fn identity(&self) -> Result<SecretKey, IdentityError> {
        load_or_create_identity(&self.meta_path()).await
    }

    /// Assemble a drive over an opened index and a transport.
    ///
    /// The swarm's identity is the drive's peer identity: it is what remote
    ///  peers fetch from.
    pub async fn build<I: IndexProvider>(
        self,
        index: I,
        swarm: Arc<dyn Swarm>,
    ) -> Result<Drive<I>, DriveError<I::Error>> {
        let ignore = self.config.ignore_patterns()?;
        let meta_path = self.meta_path();
        let staging_path = meta_path.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_path).await?;

        let access = AccessPolicy::open(self.role, index.clone(), &meta_path).await?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (rechecks_tx, rechecks_rx) = flume::unbounded();

        Ok(Drive {
            inner: Arc::new(DriveInner {
                drive_path: self.drive_path,
                meta_path,
                staging_path,
                config: self.config,
                ignore,
                role: self.role,
                seed: self.seed,
                live: self.live,
                watch: self.watch,
                index,
                swarm,
                access,
                requested_key: self.public_key,
                public_key: RwLock::new(None),
                state: Mutex::new(DriveState::Uninitialized),
                events,
                inflight: InFlight::new(),
                write_lock: tokio::sync::Mutex::new(()),
                replication: Mutex::new(None),
                serving: Mutex::new(None),
                watcher: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                shutdown,
                rechecks_tx,
                rechecks_rx,
            }),
        })
    }
}

#[derive(Debug)]
pub(crate) struct DriveInner<I: IndexProvider> {
    drive_path: PathBuf,
    meta_path: PathBuf,
    staging_path: PathBuf,
    config: DriveConfig,
    ignore: Vec<Regex>,
    role: Role,
    seed: bool,
    live: bool,
    watch: bool,

    index: I,
    swarm: Arc<dyn Swarm>,
    access: AccessPolicy<I>,

    requested_key: Option<PublicKey>,
    public_key: RwLock<Option<PublicKey>>,
    state: Mutex<DriveState>,
    events: broadcast::Sender<DriveEvent>,
    inflight: Arc<InFlight>,
    /// Serializes local index mutations
    write_lock: tokio::sync::Mutex<()>,

    replication: Mutex<Option<Arc<SwarmSession>>>,
    serving: Mutex<Option<Arc<SwarmSession>>>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    /// Long-running loops, stopped by `shutdown`
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Per-connection and per-fetch tasks
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    /// Filenames to reconcile again once a fetch of them lands
    rechecks_tx: flume::Sender<String>,
    rechecks_rx: flume::Receiver<String>,
}

impl<I: IndexProvider> DriveInner<I> {
    fn emit(&self, event: DriveEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: DriveState) {
        *self.state.lock() = state;
        tracing::debug!(
            "drive {}: {:?}",
            self.swarm.identity().fmt_short(),
            state
        );
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(handle);
    }

    fn public_key(&self) -> Option<PublicKey> {
        *self.public_key.read()
    }
}

/// One peer's view of a shared directory.
///
/// Cheap to clone; every clone drives the same state.
#[derive(Debug, Clone)]
pub struct Drive<I: IndexProvider> {
    inner: Arc<DriveInner<I>>,
}

impl<I: IndexProvider> Drive<I> {
    pub fn builder(drive_path: impl Into<PathBuf>) -> DriveBuilder {
        DriveBuilder::new(drive_path)
    }

    /// Bring the drive up.
    ///
    /// Bootstraps a fresh drive when neither the builder nor the index
    ///  names one; otherwise opens the existing one. Then starts serving,
    ///  reconciling and watching as configured.
    pub async fn ready(&self) -> Result<(), DriveError<I::Error>> {
        let inner = &self.inner;
        match self.state() {
            DriveState::Uninitialized => {}
            DriveState::Ready => return Ok(()),
            other => return Err(DriveError::InvalidState(other)),
        }
        let stored = match inner.index.value(PUBLIC_KEY_KEY).await? {
            Some(IndexValue::PublicKey { key }) => Some(key),
            _ => None,
        };
        if let (Some(found), Some(expected)) = (stored, inner.requested_key) {
            if found != expected {
                return Err(DriveError::PublicKeyMismatch { expected, found });
            }
        }
        let bootstrapping = stored.is_none() && inner.requested_key.is_none();
        {
            let mut state = inner.state.lock();
            if *state != DriveState::Uninitialized {
                return Err(DriveError::InvalidState(*state));
            }
            *state = if bootstrapping {
                DriveState::Bootstrapping
            } else {
                DriveState::Opening
            };
        }
        tokio::fs::create_dir_all(&inner.drive_path).await?;

        let public_key = match stored.or(inner.requested_key) {
            Some(key) => key,
            None => self.bootstrap().await?,
        };
        *inner.public_key.write() = Some(public_key);
        tracing::info!(
            "drive {} ready as {} ({:?}, seed: {}, live: {}, watch: {})",
            public_key.fmt_short(),
            inner.swarm.identity().fmt_short(),
            inner.role,
            inner.seed,
            inner.live,
            inner.watch
        );

        if inner.seed || inner.live {
            let session = inner
                .swarm
                .join(
                    public_key.discovery_key(),
                    JoinOptions {
                        announce: inner.seed,
                        lookup: inner.live,
                    },
                )
                .await?;
            let session = Arc::new(session);
            *inner.replication.lock() = Some(session.clone());
            let handle = tokio::spawn(replication_loop(
                inner.clone(),
                session,
                inner.shutdown.subscribe(),
            ));
            inner.track_task(handle);
        }

        if inner.seed {
            let session = inner
                .swarm
                .join(inner.swarm.identity().discovery_key(), JoinOptions::announce())
                .await?;
            let session = Arc::new(session);
            *inner.serving.lock() = Some(session.clone());
            let handle = tokio::spawn(serve_loop(
                inner.clone(),
                session,
                inner.shutdown.subscribe(),
            ));
            inner.track_task(handle);
        }

        if inner.live {
            let handle = tokio::spawn(reconciler::run(inner.clone(), inner.shutdown.subscribe()));
            inner.track_task(handle);
        }

        if inner.watch {
            inner.start_watcher()?;
        }

        inner.set_state(DriveState::Ready);
        inner.emit(DriveEvent::Ready);
        Ok(())
    }

    async fn bootstrap(&self) -> Result<PublicKey, DriveError<I::Error>> {
        let inner = &self.inner;
        let public_key = SecretKey::generate().public();
        tracing::info!("bootstrapping drive {}", public_key.fmt_short());

        inner
            .index
            .put(PUBLIC_KEY_KEY, IndexValue::PublicKey { key: public_key })
            .await?;
        inner.access.initialize(inner.index.local_writer()).await?;

        for (filename, change) in inner.scan_existing().await? {
            if let LocalChange::Indexed(_) = change {
                inner.emit(DriveEvent::Add { filename });
            }
        }
        Ok(public_key)
    }

    /// Replicate with a peer, admitting its feed as a writer if the grant
    ///  includes write access.
    pub async fn add_peer(&self, grant: PeerGrant) -> Result<(), DriveError<I::Error>> {
        if grant.can_write() {
            self.inner.access.add_writer(grant.diff_key).await?;
        }
        self.inner.index.add_replica(grant.diff_key).await?;
        tracing::debug!(
            "added peer {} (write: {})",
            grant.diff_key.fmt_short(),
            grant.can_write()
        );
        Ok(())
    }

    /// Bytes on disk under the drive root, not counting the meta dir
    pub async fn size(&self) -> Result<u64, DriveError<I::Error>> {
        Ok(directory_size(&self.inner.drive_path, Some(&self.inner.meta_path)).await?)
    }

    /// Run the local change decision for one file, as the watcher would
    pub async fn rescan(&self, filename: &str) -> Result<LocalChange, DriveError<I::Error>> {
        match self.state() {
            DriveState::Ready => self.inner.rescan(filename).await,
            other => Err(DriveError::InvalidState(other)),
        }
    }

    /// Apply one index row, as the live reconciler does for every row it
    ///  receives
    pub async fn reconcile(&self, entry: &IndexEntry) -> Result<Reconciled, DriveError<I::Error>> {
        self.inner.reconcile(entry).await
    }

    /// Shut the drive down.
    ///
    /// Waits (bounded) for running transfers, then leaves every swarm
    ///  session and closes the index. Nothing on disk is removed.
    pub async fn close(&self) -> Result<(), DriveError<I::Error>> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if matches!(*state, DriveState::Closing | DriveState::Closed) {
                return Ok(());
            }
            *state = DriveState::Closing;
        }

        if !inner.inflight.wait_idle(inner.config.close_timeout()).await {
            tracing::warn!(
                "closing with transfers still running: {:?}",
                inner.inflight.incoming()
            );
        }
        let _ = inner.shutdown.send(true);
        inner.watcher.lock().take();

        let serving = inner.serving.lock().take();
        let replication = inner.replication.lock().take();
        for session in serving.into_iter().chain(replication) {
            if let Err(e) = session.close().await {
                tracing::warn!("failed to leave {:?}: {}", session.topic(), e);
            }
        }

        let tasks: Vec<_> = std::mem::take(&mut *inner.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(inner.config.close_timeout(), task)
                .await
                .is_err()
            {
                tracing::warn!("drive task did not stop in time");
            }
        }
        let workers: Vec<_> = std::mem::take(&mut *inner.workers.lock());
        for worker in workers {
            worker.abort();
        }

        inner.index.close().await?;
        inner.set_state(DriveState::Closed);
        tracing::info!("drive {} closed", inner.swarm.identity().fmt_short());
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DriveEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> DriveState {
        *self.inner.state.lock()
    }

    /// The drive's shared key, known once `ready()` has run
    pub fn public_key(&self) -> Option<PublicKey> {
        self.inner.public_key()
    }

    /// Rendezvous topic of the drive: the hash of its public key
    pub fn discovery_key(&self) -> Option<Topic> {
        self.public_key().map(|key| key.discovery_key())
    }

    /// This peer's identity; what other peers fetch from
    pub fn identity(&self) -> PublicKey {
        self.inner.swarm.identity()
    }

    /// Key of this peer's own feed in the index
    pub fn diff_key(&self) -> PublicKey {
        self.inner.index.local_writer()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub async fn is_admitted(&self, identity: &PublicKey) -> Result<bool, DriveError<I::Error>> {
        Ok(self.inner.access.is_admitted(identity).await?)
    }

    pub fn index(&self) -> &I {
        &self.inner.index
    }

    pub fn path(&self) -> &Path {
        &self.inner.drive_path
    }

    pub fn meta_path(&self) -> &Path {
        &self.inner.meta_path
    }

    /// Whether any fetch is writing to disk
    pub fn is_busy(&self) -> bool {
        self.inner.inflight.is_busy()
    }

    /// Filenames currently being fetched
    pub fn incoming(&self) -> Vec<String> {
        self.inner.inflight.incoming()
    }
}

/// Replicate the index over every connection on the drive topic
async fn replication_loop<I: IndexProvider>(
    inner: Arc<DriveInner<I>>,
    session: Arc<SwarmSession>,
    mut shutdown: watch::Receiver<bool>,
) {
    let me = inner.swarm.identity();
    loop {
        let connection = tokio::select! {
            _ = shutdown.changed() => break,
            connection = session.accept() => match connection {
                Some(connection) => connection,
                None => break,
            },
        };
        if connection.peer == me {
            tracing::trace!("ignoring replication connection to ourselves");
            continue;
        }

        let peer = connection.peer;
        tracing::debug!(
            "{}: replicating with {} (initiator: {})",
            me.fmt_short(),
            peer.fmt_short(),
            connection.initiator
        );
        let index = inner.index.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = index.replicate(connection.initiator, connection.stream).await {
                tracing::debug!("replication with {} ended: {}", peer.fmt_short(), e);
            }
        });
        inner.track_worker(handle);
    }
}

/// Answer file requests on this peer's own topic
async fn serve_loop<I: IndexProvider>(
    inner: Arc<DriveInner<I>>,
    session: Arc<SwarmSession>,
    mut shutdown: watch::Receiver<bool>,
) {
    let me = inner.swarm.identity();
    loop {
        let connection = tokio::select! {
            _ = shutdown.changed() => break,
            connection = session.accept() => match connection {
                Some(connection) => connection,
                None => break,
            },
        };
        if connection.peer == me {
            continue;
        }

        let peer = connection.peer;
        let serving = inner.clone();
        let handle = tokio::spawn(async move {
            match serve_connection(&serving.index, &serving.drive_path, connection).await {
                Ok(bytes) => tracing::debug!("served {} bytes to {}", bytes, peer.fmt_short()),
                Err(e) => tracing::warn!("declined request from {}: {}", peer.fmt_short(), e),
            }
        });
        inner.track_worker(handle);
    }
}
