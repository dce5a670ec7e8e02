//! UDP has no connection, so sessions are synthesized per peer address and
//! expired by inactivity.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{net::UdpSocket, sync::mpsc};

use crate::portmux::{
    net,
    socket::{Listener, ListenerTasks, NewConnectFn, READ_BUF, SocketCore},
    tunnel::endpoint::{EndPoint, EndpointEvent, Subscriber, SubscriberSlot},
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type SessionTable = DashMap<SocketAddr, Arc<UdpSession>>;
type Outbound = mpsc::UnboundedSender<(Bytes, SocketAddr)>;

/// Listens on one UDP port and reports each new peer as a [`UdpSession`].
pub struct UdpServer {
    bind_addr: String,
    idle_timeout: Duration,
    on_new_connect: NewConnectFn,
    sessions: Arc<SessionTable>,
    tasks: ListenerTasks,
}

impl UdpServer {
    /// `idle_timeout` of zero keeps sessions until they are closed explicitly.
    pub fn new(
        bind_addr: impl Into<String>,
        idle_timeout: Duration,
        on_new_connect: NewConnectFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: bind_addr.into(),
            idle_timeout,
            on_new_connect,
            sessions: Arc::new(DashMap::new()),
            tasks: ListenerTasks::default(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl Listener for UdpServer {
    async fn start(&self) -> bool {
        let bind = net::normalize_bind_addr(&self.bind_addr);
        let sock = match UdpSocket::bind(bind.as_ref()).await {
            Ok(s) => Arc::new(s),
            Err(err) => {
                tracing::warn!(bind = %self.bind_addr, err = %err, "udp: bind failed");
                return false;
            }
        };
        let local = sock.local_addr().ok();

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = vec![
            tokio::spawn(send_to_loop(sock.clone(), rx)),
            tokio::spawn(recv_loop(
                sock,
                self.sessions.clone(),
                tx,
                self.on_new_connect.clone(),
            )),
        ];
        if !self.idle_timeout.is_zero() {
            tasks.push(tokio::spawn(sweep_loop(
                Arc::downgrade(&self.sessions),
                self.idle_timeout,
            )));
        }

        if !self.tasks.install(local, tasks) {
            return false;
        }
        tracing::debug!(bind = %self.bind_addr, local = ?local, "udp: listening");
        true
    }

    fn close(&self) {
        if !self.tasks.close() {
            return;
        }
        let sessions = self.session_count();
        let open: Vec<Arc<UdpSession>> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for s in open {
            s.close();
        }
        tracing::debug!(bind = %self.bind_addr, sessions, "udp: listener closed");
    }

    async fn wait_closed(&self) {
        self.tasks.wait_closed().await;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.tasks.local_addr()
    }
}

async fn recv_loop(
    sock: Arc<UdpSocket>,
    sessions: Arc<SessionTable>,
    out: Outbound,
    on_new_connect: NewConnectFn,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let (n, peer) = match sock.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::trace!(err = %err, "udp: recv failed");
                continue;
            }
        };
        let data = Bytes::copy_from_slice(&buf[..n]);

        // Clone out of the map; handlers may remove entries.
        let existing = sessions.get(&peer).map(|e| e.value().clone());
        let session = match existing {
            Some(s) => s,
            None => {
                let s = UdpSession::new(peer, out.clone(), Arc::downgrade(&sessions));
                sessions.insert(peer, s.clone());
                tracing::trace!(peer = %peer, "udp: new session");
                on_new_connect(s.clone());
                s
            }
        };
        session.on_receive_data(data);
    }
}

async fn send_to_loop(sock: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>) {
    while let Some((b, peer)) = rx.recv().await {
        if let Err(err) = sock.send_to(&b, peer).await {
            tracing::trace!(peer = %peer, err = %err, "udp: send failed");
        }
    }
}

async fn sweep_loop(sessions: Weak<SessionTable>, idle: Duration) {
    let mut tick = tokio::time::interval(idle.min(SWEEP_INTERVAL));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let Some(table) = sessions.upgrade() else {
            return;
        };
        let now = Instant::now();
        let dead: Vec<Arc<UdpSession>> = table
            .iter()
            .filter(|e| e.value().idle_for(now) > idle)
            .map(|e| e.value().clone())
            .collect();
        drop(table);
        for s in dead {
            tracing::debug!(peer = %s.peer, "udp: session idle timeout");
            s.close();
        }
    }
}

/// One peer of a [`UdpServer`].
pub struct UdpSession {
    peer: SocketAddr,
    out: Outbound,
    table: Weak<SessionTable>,
    sub: SubscriberSlot,
    last_active: Mutex<Instant>,
    closed: AtomicBool,
}

impl UdpSession {
    fn new(peer: SocketAddr, out: Outbound, table: Weak<SessionTable>) -> Arc<Self> {
        Arc::new(Self {
            peer,
            out,
            table,
            sub: SubscriberSlot::default(),
            last_active: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }
}

#[async_trait]
impl EndPoint for UdpSession {
    fn subscribe(&self, subscriber: Subscriber) {
        self.sub.set(subscriber);
    }

    async fn start(&self) -> bool {
        self.touch();
        !self.closed.load(Ordering::Acquire)
    }

    fn write(&self, data: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.touch();
        let _ = self.out.send((data, self.peer));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Only remove our own entry; the peer may already have a newer session.
        if let Some(table) = self.table.upgrade() {
            table.remove_if(&self.peer, |_, v| std::ptr::eq(v.as_ref(), self));
        }
        self.sub.emit(EndpointEvent::Close);
    }

    fn on_receive_data(&self, data: Bytes) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.touch();
        self.sub.emit(EndpointEvent::Data(data));
    }
}

/// Connected UDP socket toward a single target. Datagrams from any other
/// source are discarded by the OS.
pub struct UdpClient {
    core: Arc<SocketCore>,
    target: String,
}

impl UdpClient {
    pub fn new(target: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(SocketCore::default()),
            target: target.into(),
        })
    }

    async fn connect(&self) -> std::io::Result<UdpSocket> {
        let addr = tokio::net::lookup_host(&self.target)
            .await?
            .next()
            .ok_or_else(|| std::io::Error::other("no address"))?;
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let sock = UdpSocket::bind(bind).await?;
        sock.connect(addr).await?;
        Ok(sock)
    }
}

#[async_trait]
impl EndPoint for UdpClient {
    fn subscribe(&self, subscriber: Subscriber) {
        self.core.subscribe(subscriber);
    }

    async fn start(&self) -> bool {
        if self.core.is_closed() {
            return false;
        }
        let sock = match self.connect().await {
            Ok(s) => Arc::new(s),
            Err(err) => {
                tracing::debug!(target_addr = %self.target, err = %err, "udp: connect failed");
                self.core.close();
                return false;
            }
        };
        let core = &self.core;
        core.install(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(send_loop(sock.clone(), rx));
            let reader = tokio::spawn(connected_recv_loop(sock, core.clone()));
            (tx, reader)
        })
    }

    fn write(&self, data: Bytes) {
        self.core.write(data);
    }

    fn close(&self) {
        self.core.close();
    }

    fn on_receive_data(&self, data: Bytes) {
        self.core.emit_data(data);
    }
}

async fn connected_recv_loop(sock: Arc<UdpSocket>, core: Arc<SocketCore>) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match sock.recv(&mut buf).await {
            Ok(n) => core.emit_data(Bytes::copy_from_slice(&buf[..n])),
            // ICMP port unreachable from an earlier send; the target may come up later.
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {}
            Err(err) => {
                tracing::trace!(err = %err, "udp: recv failed");
                break;
            }
        }
    }
    core.close();
}

async fn send_loop(sock: Arc<UdpSocket>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(b) = rx.recv().await {
        if let Err(err) = sock.send(&b).await {
            tracing::trace!(err = %err, "udp: send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portmux::{
        socket::testutil::{ChannelHandler, watch},
        tunnel::endpoint::SharedEndPoint,
    };

    const WAIT: Duration = Duration::from_secs(5);

    type Accepted = (
        SharedEndPoint,
        Arc<ChannelHandler>,
        mpsc::UnboundedReceiver<EndpointEvent>,
    );

    /// Server whose callback subscribes synchronously, like a Pipe would.
    async fn server(idle: Duration) -> (Arc<UdpServer>, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel::<Accepted>();
        let srv = UdpServer::new(
            "127.0.0.1:0",
            idle,
            Arc::new(move |ep: SharedEndPoint| {
                let (h, events) = watch(ep.as_ref());
                let _ = tx.send((ep, h, events));
            }),
        );
        assert!(srv.start().await);
        (srv, rx)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn per_peer_sessions_relay_both_ways() {
        let (srv, mut accepted) = server(Duration::ZERO).await;
        let addr = srv.local_addr().unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"hi", addr).await.unwrap();
        let (session, _h, mut events) = next(&mut accepted).await;
        assert_eq!(
            next(&mut events).await,
            EndpointEvent::Data(Bytes::from_static(b"hi"))
        );

        peer.send_to(b"again", addr).await.unwrap();
        assert_eq!(
            next(&mut events).await,
            EndpointEvent::Data(Bytes::from_static(b"again"))
        );
        assert_eq!(srv.session_count(), 1);

        assert!(session.start().await);
        session.write(Bytes::from_static(b"reply"));
        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, addr);

        srv.close();
    }

    #[tokio::test]
    async fn closed_session_is_replaced_by_a_fresh_one() {
        let (srv, mut accepted) = server(Duration::ZERO).await;
        let addr = srv.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer.send_to(b"one", addr).await.unwrap();
        let (first, _h1, mut ev1) = next(&mut accepted).await;
        let _ = next(&mut ev1).await;

        first.close();
        assert_eq!(next(&mut ev1).await, EndpointEvent::Close);
        assert_eq!(srv.session_count(), 0);

        peer.send_to(b"two", addr).await.unwrap();
        let (second, _h2, mut ev2) = next(&mut accepted).await;
        assert_eq!(
            next(&mut ev2).await,
            EndpointEvent::Data(Bytes::from_static(b"two"))
        );
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(srv.session_count(), 1);
        srv.close();
    }

    #[tokio::test]
    async fn idle_sessions_are_swept() {
        let (srv, mut accepted) = server(Duration::from_millis(200)).await;
        let addr = srv.local_addr().unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer.send_to(b"x", addr).await.unwrap();
        let (_s, _h, mut events) = next(&mut accepted).await;
        let _ = next(&mut events).await;

        assert_eq!(next(&mut events).await, EndpointEvent::Close);
        assert_eq!(srv.session_count(), 0);
        srv.close();
    }

    #[tokio::test]
    async fn client_talks_only_to_its_target() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpClient::new(target.local_addr().unwrap().to_string());
        let (_h, mut events) = watch(client.as_ref());
        assert!(client.start().await);

        client.write(Bytes::from_static(b"q"));
        let mut buf = [0u8; 64];
        let (n, client_addr) = tokio::time::timeout(WAIT, target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"q");

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"spoof", client_addr).await.unwrap();
        target.send_to(b"a", client_addr).await.unwrap();
        assert_eq!(
            next(&mut events).await,
            EndpointEvent::Data(Bytes::from_static(b"a"))
        );

        client.close();
        assert_eq!(next(&mut events).await, EndpointEvent::Close);
    }
}
