use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use super::{
    JoinOptions, PeerConnection, SessionControl, SessionSink, Swarm, SwarmError, SwarmSession,
};
use crate::crypto::{PublicKey, Topic};

const DUPLEX_BUFFER: usize = 256 * 1024;

/// In-process rendezvous shared by every [`MemorySwarm`] created from it.
///
/// Connections are `tokio::io::duplex` pairs. A lookup session dials every
///  announcing session on the topic, including other sessions held by the
///  same identity, exactly like a real swarm that finds itself.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Debug, Default)]
struct NetworkInner {
    next_session: u64,
    sessions: HashMap<u64, Registration>,
    /// Session pairs currently linked, smaller id first
    links: HashMap<(u64, u64), Link>,
    /// Connections dialed per topic
    dials: HashMap<Topic, usize>,
}

#[derive(Debug)]
struct Registration {
    topic: Topic,
    identity: PublicKey,
    options: JoinOptions,
    sink: SessionSink,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport handle for one peer
    pub fn swarm(&self, identity: PublicKey) -> MemorySwarm {
        MemorySwarm {
            identity,
            network: self.clone(),
        }
    }

    /// How many connections have been dialed on a topic so far
    pub fn dials(&self, topic: &Topic) -> usize {
        self.inner.lock().dials.get(topic).copied().unwrap_or(0)
    }

    /// How many sessions are currently joined to a topic
    pub fn sessions_on(&self, topic: &Topic) -> usize {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|reg| reg.topic == *topic)
            .count()
    }

    fn allocate(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_session += 1;
        inner.next_session
    }

    fn register(&self, id: u64, registration: Registration) {
        let mut inner = self.inner.lock();
        inner.sessions.insert(id, registration);
        inner.link_all(id);
    }

    /// Re-dial everyone on the topic; the connections being replaced are cut
    fn rejoin(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.links.retain(|(a, b), link| {
            let superseded = *a == id || *b == id;
            if superseded {
                link.sever();
            }
            !superseded
        });
        inner.link_all(id);
    }

    /// Streams already handed out outlive the session
    fn leave(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.sessions.remove(&id);
        inner.links.retain(|(a, b), _| *a != id && *b != id);
    }
}

impl NetworkInner {
    fn link_all(&mut self, id: u64) {
        let Some(me) = self.sessions.get(&id) else {
            return;
        };
        let (topic, options) = (me.topic, me.options);
        let pairs: Vec<(u64, u64)> = self
            .sessions
            .iter()
            .filter(|(other, reg)| **other != id && reg.topic == topic)
            .filter_map(|(other, reg)| {
                if options.lookup && reg.options.announce {
                    Some((id, *other))
                } else if options.announce && reg.options.lookup {
                    Some((*other, id))
                } else {
                    None
                }
            })
            .collect();
        for (initiator, acceptor) in pairs {
            self.dial(topic, initiator, acceptor);
        }
    }

    fn dial(&mut self, topic: Topic, initiator: u64, acceptor: u64) {
        let pair = (initiator.min(acceptor), initiator.max(acceptor));
        if self.links.contains_key(&pair) {
            return;
        }
        let (Some(from), Some(to)) = (self.sessions.get(&initiator), self.sessions.get(&acceptor))
        else {
            return;
        };
        *self.dials.entry(topic).or_default() += 1;
        tracing::trace!(
            "memory swarm: {} dialed {} on {:?}",
            from.identity.fmt_short(),
            to.identity.fmt_short(),
            topic
        );

        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        let (near, far) = (MemoryStream::new(near), MemoryStream::new(far));
        let link = Link {
            ends: [near.cut.clone(), far.cut.clone()],
        };
        from.sink.deliver(PeerConnection {
            peer: to.identity,
            initiator: true,
            stream: Box::new(near),
        });
        to.sink.deliver(PeerConnection {
            peer: from.identity,
            initiator: false,
            stream: Box::new(far),
        });
        self.links.insert(pair, link);
    }
}

#[derive(Debug)]
struct Link {
    ends: [Arc<Cut>; 2],
}

impl Link {
    fn sever(&self) {
        for end in &self.ends {
            end.sever();
        }
    }
}

/// Lets the network hang up a stream it handed out
#[derive(Debug, Default)]
struct Cut {
    severed: AtomicBool,
    reader: AtomicWaker,
    writer: AtomicWaker,
}

impl Cut {
    fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
        self.reader.wake();
        self.writer.wake();
    }

    fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }
}

/// One end of an in-memory link. Reads end and writes fail once the link
///  is severed.
#[derive(Debug)]
struct MemoryStream {
    inner: DuplexStream,
    cut: Arc<Cut>,
}

impl MemoryStream {
    fn new(inner: DuplexStream) -> Self {
        Self {
            inner,
            cut: Arc::new(Cut::default()),
        }
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.cut.reader.register(cx.waker());
        if self.cut.is_severed() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.cut.writer.register(cx.waker());
        if self.cut.is_severed() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// One peer's handle onto a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemorySwarm {
    identity: PublicKey,
    network: MemoryNetwork,
}

#[derive(Debug)]
struct MemorySessionControl {
    id: u64,
    network: MemoryNetwork,
}

#[async_trait]
impl SessionControl for MemorySessionControl {
    async fn rejoin(&self) -> Result<(), SwarmError> {
        self.network.rejoin(self.id);
        Ok(())
    }

    async fn leave(&self) -> Result<(), SwarmError> {
        self.network.leave(self.id);
        Ok(())
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    fn identity(&self) -> PublicKey {
        self.identity
    }

    async fn join(&self, topic: Topic, options: JoinOptions) -> Result<SwarmSession, SwarmError> {
        let id = self.network.allocate();
        let control = Arc::new(MemorySessionControl {
            id,
            network: self.network.clone(),
        });
        let (session, sink) = SwarmSession::new(topic, self.identity, options, control);
        self.network.register(
            id,
            Registration {
                topic,
                identity: self.identity,
                options,
                sink,
            },
        );
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::crypto::SecretKey;

    #[tokio::test]
    async fn test_lookup_finds_announcer() {
        let network = MemoryNetwork::new();
        let alice = network.swarm(SecretKey::generate().public());
        let bob = network.swarm(SecretKey::generate().public());
        let topic = Topic::derive(b"drive");

        let serving = alice.join(topic, JoinOptions::announce()).await.unwrap();
        let client = bob.join(topic, JoinOptions::lookup()).await.unwrap();

        let mut outbound = client.accept().await.unwrap();
        let mut inbound = serving.accept().await.unwrap();
        assert_eq!(outbound.peer, alice.identity());
        assert!(outbound.initiator);
        assert_eq!(inbound.peer, bob.identity());
        assert!(!inbound.initiator);

        outbound.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(network.dials(&topic), 1);
    }

    #[tokio::test]
    async fn test_two_lookups_never_connect() {
        let network = MemoryNetwork::new();
        let topic = Topic::derive(b"drive");
        let a = network.swarm(SecretKey::generate().public());
        let b = network.swarm(SecretKey::generate().public());

        let _sa = a.join(topic, JoinOptions::lookup()).await.unwrap();
        let _sb = b.join(topic, JoinOptions::lookup()).await.unwrap();
        assert_eq!(network.dials(&topic), 0);
    }

    #[tokio::test]
    async fn test_own_sessions_connect_to_each_other() {
        let network = MemoryNetwork::new();
        let key = SecretKey::generate().public();
        let me = network.swarm(key);
        let topic = Topic::derive(b"drive");

        let _serving = me.join(topic, JoinOptions::announce()).await.unwrap();
        let client = me.join(topic, JoinOptions::lookup()).await.unwrap();
        let echo = client.accept().await.unwrap();
        assert_eq!(echo.peer, key);
    }

    #[tokio::test]
    async fn test_refresh_peers_reports_other_peer() {
        let network = MemoryNetwork::new();
        let topic = Topic::derive(b"drive");
        let alice = network.swarm(SecretKey::generate().public());
        let bob = network.swarm(SecretKey::generate().public());

        let _serving = alice.join(topic, JoinOptions::announce()).await.unwrap();
        let client = bob.join(topic, JoinOptions::lookup()).await.unwrap();
        assert_eq!(network.dials(&topic), 1);

        let found = client
            .refresh_peers(Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(found, alice.identity());
        assert_eq!(network.dials(&topic), 2);
    }

    #[tokio::test]
    async fn test_refresh_peers_cuts_superseded_links() {
        let network = MemoryNetwork::new();
        let topic = Topic::derive(b"drive");
        let alice = network.swarm(SecretKey::generate().public());
        let bob = network.swarm(SecretKey::generate().public());

        let serving = alice.join(topic, JoinOptions::announce()).await.unwrap();
        let client = bob.join(topic, JoinOptions::lookup()).await.unwrap();
        let mut old_out = client.accept().await.unwrap();
        let mut old_in = serving.accept().await.unwrap();

        client
            .refresh_peers(Duration::from_millis(500))
            .await
            .unwrap();
        let mut buf = Vec::new();
        assert_eq!(old_in.stream.read_to_end(&mut buf).await.unwrap(), 0);
        assert!(old_out.stream.write_all(b"ping").await.is_err());

        // the replacement link works
        let mut new_out = client.accept().await.unwrap();
        let mut new_in = serving.accept().await.unwrap();
        new_out.stream.write_all(b"ping").await.unwrap();
        let mut ping = [0u8; 4];
        new_in.stream.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
    }

    #[tokio::test]
    async fn test_refresh_peers_times_out_alone() {
        let network = MemoryNetwork::new();
        let swarm = network.swarm(SecretKey::generate().public());
        let session = swarm
            .join(Topic::derive(b"empty"), JoinOptions::lookup())
            .await
            .unwrap();

        let res = session.refresh_peers(Duration::from_millis(50)).await;
        assert!(matches!(res, Err(SwarmError::Timeout)));
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let network = MemoryNetwork::new();
        let topic = Topic::derive(b"drive");
        let swarm = network.swarm(SecretKey::generate().public());
        let session = swarm.join(topic, JoinOptions::announce()).await.unwrap();
        assert_eq!(network.sessions_on(&topic), 1);

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(network.sessions_on(&topic), 0);
        assert!(session.accept().await.is_none());
        assert!(matches!(
            session.refresh_peers(Duration::from_millis(10)).await,
            Err(SwarmError::Closed)
        ));
    }
}
