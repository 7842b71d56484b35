use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use iroh::discovery::pkarr::dht::DhtDiscovery;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{Endpoint, NodeAddr};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
    JoinOptions, PeerConnection, SessionControl, SessionSink, Swarm, SwarmError, SwarmSession,
};
use crate::crypto::{PublicKey, SecretKey, Topic};
use crate::wire::{read_frame, write_frame};

/// ALPN for topic-scoped swarm connections
pub const SWARM_ALPN: &[u8] = b"/peerdrive/swarm/1";

/// First exchange on every swarm connection: the dialer names the topic,
///  the acceptor says whether anything there is announcing.
#[derive(Debug, Serialize, Deserialize)]
enum Handshake {
    Hello { topic: Topic },
    HelloAck { accepted: bool },
}

#[derive(Default)]
pub struct IrohSwarmBuilder {
    /// the socket addr to expose the endpoint on
    ///  if not set, an ephemeral port will be used
    socket_address: Option<SocketAddr>,
    secret_key: Option<SecretKey>,
    /// peers to dial on lookup
    peers: Vec<NodeAddr>,
}

impl IrohSwarmBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn socket_address(mut self, socket_addr: SocketAddr) -> Self {
        self.socket_address = Some(socket_addr);
        self
    }

    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.secret_key = Some(secret_key);
        self
    }

    pub fn peer(mut self, addr: NodeAddr) -> Self {
        self.peers.push(addr);
        self
    }

    pub async fn build(self) -> Result<IrohSwarm, SwarmError> {
        let socket_addr = self
            .socket_address
            .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0));
        let secret_key = self.secret_key.unwrap_or_else(SecretKey::generate);

        let mainline_discovery = DhtDiscovery::builder()
            .secret_key(secret_key.0.clone())
            .build()
            .map_err(|e| anyhow!("failed to build mainline discovery: {}", e))?;

        let ip = match socket_addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(ip) => {
                return Err(anyhow!("ipv6 bind address {} is not supported", ip).into())
            }
        };
        let endpoint = Endpoint::builder()
            .secret_key(secret_key.0.clone())
            .discovery(mainline_discovery)
            .bind_addr_v4(SocketAddrV4::new(ip, socket_addr.port()))
            .bind()
            .await
            .map_err(|e| anyhow!("failed to bind endpoint: {}", e))?;

        let table = Arc::new(TopicTable::default());
        let router = Router::builder(endpoint.clone())
            .accept(SWARM_ALPN, SwarmHandler {
                table: table.clone(),
            })
            .spawn();

        let book = self
            .peers
            .into_iter()
            .map(|addr| (PublicKey::from(addr.node_id), addr))
            .collect();

        tracing::info!("swarm endpoint {} bound", secret_key.public().fmt_short());
        Ok(IrohSwarm {
            inner: Arc::new(IrohSwarmInner {
                identity: secret_key.public(),
                endpoint,
                router,
                table,
                book: Mutex::new(book),
                next_session: AtomicU64::new(0),
            }),
        })
    }
}

/// A [`Swarm`] over an iroh endpoint.
///
/// Announcing sessions are served by a router on [`SWARM_ALPN`]. Lookup
///  sessions dial every peer in the address book and keep the connections
///  whose owner is announcing the topic.
#[derive(Debug, Clone)]
pub struct IrohSwarm {
    inner: Arc<IrohSwarmInner>,
}

#[derive(Debug)]
struct IrohSwarmInner {
    identity: PublicKey,
    endpoint: Endpoint,
    router: Router,
    table: Arc<TopicTable>,
    book: Mutex<BTreeMap<PublicKey, NodeAddr>>,
    next_session: AtomicU64,
}

#[derive(Debug, Default)]
struct TopicTable {
    sessions: Mutex<HashMap<u64, Slot>>,
}

#[derive(Debug)]
struct Slot {
    topic: Topic,
    options: JoinOptions,
    sink: SessionSink,
    /// peers this session already holds a connection to
    connected: HashSet<PublicKey>,
}

impl TopicTable {
    /// Sink of the first session announcing `topic`
    fn announcer(&self, topic: &Topic) -> Option<SessionSink> {
        self.sessions
            .lock()
            .values()
            .find(|slot| slot.topic == *topic && slot.options.announce)
            .map(|slot| slot.sink.clone())
    }
}

impl IrohSwarm {
    pub fn builder() -> IrohSwarmBuilder {
        IrohSwarmBuilder::new()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Remember a peer to dial on lookup
    pub fn add_peer_addr(&self, addr: NodeAddr) {
        self.inner
            .book
            .lock()
            .insert(PublicKey::from(addr.node_id), addr);
    }

    /// Remember a peer by key alone, leaving address resolution to discovery
    pub fn add_peer(&self, peer: PublicKey) {
        self.add_peer_addr(NodeAddr::new(*peer));
    }

    pub async fn shutdown(&self) -> Result<(), SwarmError> {
        self.inner
            .router
            .shutdown()
            .await
            .map_err(|e| anyhow!("router shutdown failed: {}", e))?;
        Ok(())
    }

    /// Dial every known peer for one lookup session
    fn lookup(&self, id: u64) {
        let slot = self
            .inner
            .table
            .sessions
            .lock()
            .get(&id)
            .map(|slot| (slot.topic, slot.sink.clone(), slot.connected.clone()));
        let Some((topic, sink, connected)) = slot else {
            return;
        };
        let targets: Vec<NodeAddr> = self
            .inner
            .book
            .lock()
            .iter()
            .filter(|(key, _)| **key != self.inner.identity && !connected.contains(key))
            .map(|(_, addr)| addr.clone())
            .collect();

        for addr in targets {
            let swarm = self.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let peer = PublicKey::from(addr.node_id);
                match dial(&swarm.inner.endpoint, addr, topic).await {
                    Ok(Some(stream)) => {
                        if let Some(slot) = swarm.inner.table.sessions.lock().get_mut(&id) {
                            if !slot.connected.insert(peer) {
                                return;
                            }
                        }
                        sink.deliver(PeerConnection {
                            peer,
                            initiator: true,
                            stream: Box::new(stream),
                        });
                    }
                    Ok(None) => {
                        tracing::trace!("{} is not announcing {:?}", peer.fmt_short(), topic)
                    }
                    Err(e) => tracing::debug!("failed to dial {}: {}", peer.fmt_short(), e),
                }
            });
        }
    }
}

async fn dial(
    endpoint: &Endpoint,
    addr: NodeAddr,
    topic: Topic,
) -> anyhow::Result<Option<IrohStream>> {
    let conn = endpoint.connect(addr, SWARM_ALPN).await?;
    let (mut send, mut recv) = conn.open_bi().await?;
    write_frame(&mut send, &Handshake::Hello { topic }).await?;
    match read_frame::<_, Handshake>(&mut recv).await? {
        Some(Handshake::HelloAck { accepted: true }) => Ok(Some(IrohStream { conn, send, recv })),
        Some(Handshake::HelloAck { accepted: false }) | None => Ok(None),
        Some(other) => Err(anyhow!("unexpected handshake frame {:?}", other)),
    }
}

#[derive(Debug)]
struct IrohSessionControl {
    id: u64,
    swarm: IrohSwarm,
}

#[async_trait]
impl SessionControl for IrohSessionControl {
    async fn rejoin(&self) -> Result<(), SwarmError> {
        let lookup = {
            let mut sessions = self.swarm.inner.table.sessions.lock();
            match sessions.get_mut(&self.id) {
                Some(slot) => {
                    slot.connected.clear();
                    slot.options.lookup
                }
                None => return Err(SwarmError::Closed),
            }
        };
        if lookup {
            self.swarm.lookup(self.id);
        }
        Ok(())
    }

    async fn leave(&self) -> Result<(), SwarmError> {
        self.swarm.inner.table.sessions.lock().remove(&self.id);
        Ok(())
    }
}

#[async_trait]
impl Swarm for IrohSwarm {
    fn identity(&self) -> PublicKey {
        self.inner.identity
    }

    async fn join(&self, topic: Topic, options: JoinOptions) -> Result<SwarmSession, SwarmError> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let control = Arc::new(IrohSessionControl {
            id,
            swarm: self.clone(),
        });
        let (session, sink) = SwarmSession::new(topic, self.inner.identity, options, control);
        self.inner.table.sessions.lock().insert(
            id,
            Slot {
                topic,
                options,
                sink,
                connected: HashSet::new(),
            },
        );
        tracing::debug!(
            "joined {:?} (announce: {}, lookup: {})",
            topic,
            options.announce,
            options.lookup
        );
        if options.lookup {
            self.lookup(id);
        }
        Ok(session)
    }
}

#[derive(Debug, Clone)]
struct SwarmHandler {
    table: Arc<TopicTable>,
}

impl ProtocolHandler for SwarmHandler {
    #[allow(refining_impl_trait)]
    fn accept(&self, conn: Connection) -> BoxFuture<'static, Result<(), AcceptError>> {
        let table = self.table.clone();
        Box::pin(async move {
            let remote = conn.remote_node_id().map_err(|e| {
                tracing::error!("failed to read remote node id: {}", e);
                AcceptError::from(io::Error::other(e))
            })?;
            let (mut send, mut recv) = conn.accept_bi().await.map_err(|e| {
                tracing::error!("failed to accept bidirectional stream: {}", e);
                AcceptError::from(e)
            })?;

            let topic = match read_frame::<_, Handshake>(&mut recv).await {
                Ok(Some(Handshake::Hello { topic })) => topic,
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::debug!("bad swarm handshake from {}: {}", remote.fmt_short(), e);
                    return Ok(());
                }
            };

            let announcer = table.announcer(&topic);
            let accepted = announcer.is_some();
            write_frame(&mut send, &Handshake::HelloAck { accepted })
                .await
                .map_err(|e| AcceptError::from(io::Error::other(e)))?;

            if let Some(sink) = announcer {
                sink.deliver(PeerConnection {
                    peer: PublicKey::from(remote),
                    initiator: false,
                    stream: Box::new(IrohStream { conn, send, recv }),
                });
            } else {
                let _ = send.finish();
                conn.closed().await;
            }
            Ok(())
        })
    }
}

/// One bidirectional QUIC stream, holding its connection open
struct IrohStream {
    #[allow(dead_code)]
    conn: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        // quinn's inherent poll_write returns its own error type
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}
