//! Topic-scoped peer rendezvous.
//!
//! A [`Swarm`] is the transport handle a drive is constructed with. Joining a
//!  topic yields a [`SwarmSession`]: a stream of connected peers, each with a
//!  raw duplex byte stream. Sessions that *announce* can be found by others;
//!  sessions that *look up* go find announcers. Keeping the two apart lets an
//!  owner serve without dialing anybody and a pure client dial without
//!  accepting inbound connections.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::crypto::{PublicKey, Topic};

mod iroh_transport;
mod memory;

pub use iroh_transport::{IrohSwarm, IrohSwarmBuilder, SWARM_ALPN};
pub use memory::{MemoryNetwork, MemorySwarm};

/// Any duplex byte stream a swarm can hand out
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedPeerStream = Box<dyn PeerStream>;

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("no peer appeared before the deadline")]
    Timeout,
    #[error("swarm session is closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// How to take part in a topic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinOptions {
    /// Let peers looking up the topic find us
    pub announce: bool,
    /// Go find peers announcing the topic
    pub lookup: bool,
}

impl JoinOptions {
    pub fn announce() -> Self {
        Self {
            announce: true,
            lookup: false,
        }
    }

    pub fn lookup() -> Self {
        Self {
            announce: false,
            lookup: true,
        }
    }
}

/// An established connection to one peer on a topic
pub struct PeerConnection {
    /// Identity of the remote end. May be our own identity: a swarm will
    ///  happily connect two of our own sessions to each other.
    pub peer: PublicKey,
    /// Whether we dialed
    pub initiator: bool,
    pub stream: BoxedPeerStream,
}

impl Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

/// The transport a drive is constructed with
#[async_trait]
pub trait Swarm: Send + Sync + Debug + 'static {
    /// Identity this swarm connects as
    fn identity(&self) -> PublicKey;

    async fn join(&self, topic: Topic, options: JoinOptions) -> Result<SwarmSession, SwarmError>;
}

/// Backend half of a session
#[async_trait]
pub trait SessionControl: Send + Sync + Debug {
    /// Drop what we know about the topic and go looking again
    async fn rejoin(&self) -> Result<(), SwarmError>;

    /// Leave the topic. May take a while to settle.
    async fn leave(&self) -> Result<(), SwarmError>;
}

/// Handle a backend uses to hand connections to its session
#[derive(Debug, Clone)]
pub struct SessionSink {
    connections: flume::Sender<PeerConnection>,
    discovered: broadcast::Sender<PublicKey>,
}

impl SessionSink {
    /// Returns false once the session is gone
    pub fn deliver(&self, connection: PeerConnection) -> bool {
        let peer = connection.peer;
        if self.connections.send(connection).is_err() {
            return false;
        }
        // nobody listening for discoveries is fine
        let _ = self.discovered.send(peer);
        true
    }
}

/// One joined topic
#[derive(Debug)]
pub struct SwarmSession {
    topic: Topic,
    identity: PublicKey,
    options: JoinOptions,
    connections: flume::Receiver<PeerConnection>,
    discovered: broadcast::Sender<PublicKey>,
    control: Arc<dyn SessionControl>,
    closed: AtomicBool,
}

impl SwarmSession {
    pub fn new(
        topic: Topic,
        identity: PublicKey,
        options: JoinOptions,
        control: Arc<dyn SessionControl>,
    ) -> (Self, SessionSink) {
        let (tx, rx) = flume::unbounded();
        let (discovered, _) = broadcast::channel(64);
        let sink = SessionSink {
            connections: tx,
            discovered: discovered.clone(),
        };
        let session = Self {
            topic,
            identity,
            options,
            connections: rx,
            discovered,
            control,
            closed: AtomicBool::new(false),
        };
        (session, sink)
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn options(&self) -> JoinOptions {
        self.options
    }

    /// Next connection, `None` once the session is closed
    pub async fn accept(&self) -> Option<PeerConnection> {
        self.connections.recv_async().await.ok()
    }

    /// A receiver of this session's connections, for handing to a task
    pub fn connections(&self) -> flume::Receiver<PeerConnection> {
        self.connections.clone()
    }

    /// Rejoin the topic and resolve with the first other peer that connects.
    ///
    /// The connection itself still arrives through [`Self::accept`]; this
    ///  only reports who it was.
    pub async fn refresh_peers(&self, timeout: Duration) -> Result<PublicKey, SwarmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwarmError::Closed);
        }
        let mut discovered = self.discovered.subscribe();
        self.control.rejoin().await?;

        let wait = async {
            loop {
                match discovered.recv().await {
                    Ok(peer) if peer != self.identity => return Ok(peer),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(SwarmError::Closed),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SwarmError::Timeout)?
    }

    /// Leave the topic. Safe to call more than once.
    pub async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!("leaving topic {:?}", self.topic);
        self.control.leave().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
