use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::portmux::{
    protocol::{Command, DataPacket, Packet, ProtocolError},
    tunnel::{
        forward::{Role, Tunnel},
        info::TunnelKind,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("tunnel {tunnel_id} failed to start on port {source_port}")]
    StartFailed { tunnel_id: u32, source_port: u16 },
}

/// Source of pipe ids. One per server process, shared by every tunnel it
/// owns; ids are never reused for the life of the allocator.
#[derive(Debug)]
pub struct PipeIdAllocator {
    next: AtomicU32,
}

impl PipeIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PipeIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c-{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub conn: String,
    pub tunnel_id: u32,
    pub role: Role,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    pub target: String,
    pub source_port: u16,
    pub local_addr: Option<String>,
    pub pipes: usize,
}

/// Registry of tunnels per control connection.
///
/// Routing misses (unknown connection, tunnel or pipe) are silently ignored:
/// they are the normal outcome of close races between the two ends.
pub struct TunnelManager {
    conns: DashMap<ConnId, HashMap<u32, Arc<Tunnel>>>,
    conn_seq: AtomicU64,
    pipe_ids: Arc<PipeIdAllocator>,
}

impl fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelManager").finish_non_exhaustive()
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        Self::with_pipe_ids(Arc::new(PipeIdAllocator::new()))
    }

    pub fn with_pipe_ids(pipe_ids: Arc<PipeIdAllocator>) -> Self {
        Self {
            conns: DashMap::new(),
            conn_seq: AtomicU64::new(1),
            pipe_ids,
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.conn_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub fn pipe_ids(&self) -> Arc<PipeIdAllocator> {
        self.pipe_ids.clone()
    }

    /// Register and start `tunnel` under `conn`. An existing tunnel with the
    /// same id on that connection is closed and replaced; its port is released
    /// before the replacement binds. A tunnel that fails to start is removed
    /// again.
    pub async fn new_tunnel(&self, conn: ConnId, tunnel: Arc<Tunnel>) -> Result<(), TunnelError> {
        let tunnel_id = tunnel.id();
        let old = self
            .conns
            .entry(conn)
            .or_default()
            .insert(tunnel_id, tunnel.clone());
        if let Some(old) = old {
            tracing::debug!(conn = %conn, tunnel_id, "tunnel: replacing existing registration");
            old.close();
            old.wait_closed().await;
        }

        if tunnel.start().await {
            self.update_gauge();
            return Ok(());
        }

        if let Some(mut m) = self.conns.get_mut(&conn) {
            if m.get(&tunnel_id).is_some_and(|t| Arc::ptr_eq(t, &tunnel)) {
                m.remove(&tunnel_id);
            }
        }
        tunnel.close();
        self.update_gauge();
        Err(TunnelError::StartFailed {
            tunnel_id,
            source_port: tunnel.info().source_port,
        })
    }

    pub fn tunnel(&self, conn: ConnId, tunnel_id: u32) -> Option<Arc<Tunnel>> {
        self.conns
            .get(&conn)
            .and_then(|m| m.get(&tunnel_id).cloned())
    }

    /// Client side: the server opened `pipe_id` on `tunnel_id`. `false` on a
    /// routing miss or a rejected duplicate.
    pub fn on_recv_tunnel_connect(&self, conn: ConnId, tunnel_id: u32, pipe_id: u32) -> bool {
        match self.tunnel(conn, tunnel_id) {
            Some(t) => t.on_client_new_connect(pipe_id),
            None => {
                tracing::debug!(conn = %conn, tunnel_id, pipe_id, "tunnel: connect for unknown tunnel");
                false
            }
        }
    }

    pub fn on_recv_tunnel_data(&self, conn: ConnId, tunnel_id: u32, pipe_id: u32, data: Bytes) {
        if let Some(t) = self.tunnel(conn, tunnel_id) {
            t.on_receive_tunnel_data(pipe_id, data);
        }
    }

    pub fn on_recv_tunnel_close(&self, conn: ConnId, tunnel_id: u32, pipe_id: u32) {
        if let Some(t) = self.tunnel(conn, tunnel_id) {
            t.on_receive_tunnel_close(pipe_id);
        }
    }

    /// Dispatch a TunnelConnected/TunnelData/TunnelClosed packet. Returns
    /// `Ok(false)` for any other command so the caller can handle it.
    pub fn handle_packet(&self, conn: ConnId, packet: &Packet) -> Result<bool, ProtocolError> {
        let cmd = match packet.command() {
            Some(c @ (Command::TunnelConnected | Command::TunnelData | Command::TunnelClosed)) => c,
            _ => return Ok(false),
        };
        let dp = DataPacket::decode(packet.data.clone())?;
        match cmd {
            Command::TunnelConnected => {
                self.on_recv_tunnel_connect(conn, dp.tunnel_id, dp.pipe_id);
            }
            Command::TunnelData => {
                self.on_recv_tunnel_data(conn, dp.tunnel_id, dp.pipe_id, dp.payload);
            }
            _ => self.on_recv_tunnel_close(conn, dp.tunnel_id, dp.pipe_id),
        }
        Ok(true)
    }

    /// Close every tunnel owned by `conn`. Safe to call more than once.
    pub fn close(&self, conn: ConnId) {
        let Some((_, tunnels)) = self.conns.remove(&conn) else {
            return;
        };
        let n = tunnels.len();
        for t in tunnels.into_values() {
            t.close();
        }
        self.update_gauge();
        tracing::debug!(conn = %conn, tunnels = n, "tunnel: connection tunnels closed");
    }

    /// Process teardown.
    pub fn close_all(&self) {
        let conns: Vec<ConnId> = self.conns.iter().map(|e| *e.key()).collect();
        for conn in conns {
            self.close(conn);
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.conns.iter().map(|e| e.value().len()).sum()
    }

    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        let mut out = Vec::new();
        for e in self.conns.iter() {
            for t in e.value().values() {
                let info = t.info();
                out.push(TunnelSnapshot {
                    conn: e.key().to_string(),
                    tunnel_id: info.tunnel_id,
                    role: t.role(),
                    kind: info.kind,
                    target: info.target(),
                    source_port: info.source_port,
                    local_addr: t.local_addr().map(|a| a.to_string()),
                    pipes: t.pipe_count(),
                });
            }
        }
        out.sort_by(|a, b| (&a.conn, a.source_port).cmp(&(&b.conn, b.source_port)));
        out
    }

    fn update_gauge(&self) {
        metrics::gauge!("portmux_tunnels").set(self.tunnel_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        net::{TcpListener, TcpStream, UdpSocket},
        sync::mpsc,
        task::JoinHandle,
    };

    use super::*;
    use crate::portmux::{control, tunnel::info::TunnelInfo};

    const WAIT: Duration = Duration::from_secs(5);

    async fn eventually(mut f: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !f() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn pipe_ids_are_unique_and_increasing() {
        let a = PipeIdAllocator::new();
        let ids: Vec<u32> = (0..5).map(|_| a.next()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn routing_misses_are_no_ops() {
        let mgr = TunnelManager::new();
        let conn = mgr.next_conn_id();

        assert!(!mgr.on_recv_tunnel_connect(conn, 1, 1));
        mgr.on_recv_tunnel_data(conn, 1, 1, Bytes::from_static(b"x"));
        mgr.on_recv_tunnel_close(conn, 1, 1);

        let p = Packet::data_packet(Command::TunnelData, &DataPacket::header_only(7, 8));
        assert!(mgr.handle_packet(conn, &p).unwrap());
        assert_eq!(mgr.tunnel_count(), 0);

        let hb = Packet::empty(Command::Heartbeat);
        assert!(!mgr.handle_packet(conn, &hb).unwrap());

        let short = Packet::new(Command::TunnelClosed, Bytes::from_static(&[1, 2]));
        assert!(matches!(
            mgr.handle_packet(conn, &short),
            Err(ProtocolError::ShortDataPacket(2))
        ));
    }

    #[tokio::test]
    async fn failed_start_is_not_registered() {
        let held = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let mgr = TunnelManager::new();
        let conn = mgr.next_conn_id();
        let (tx, _rx) = control::channel();
        let t = Tunnel::server(
            TunnelInfo::new(TunnelKind::Tcp, "127.0.0.1", 80, port),
            tx,
            mgr.pipe_ids(),
        );
        let err = mgr.new_tunnel(conn, t.clone()).await.unwrap_err();
        assert!(matches!(err, TunnelError::StartFailed { source_port, .. } if source_port == port));
        assert_eq!(mgr.tunnel_count(), 0);
        assert!(t.is_closed());
    }

    #[tokio::test]
    async fn same_tunnel_id_replaces_and_close_is_idempotent() {
        let mgr = TunnelManager::new();
        let conn = mgr.next_conn_id();
        let other = mgr.next_conn_id();
        let info = TunnelInfo::new(TunnelKind::Tcp, "127.0.0.1", 7000, 9000);

        let (tx, _rx) = control::channel();
        let first = Tunnel::client(info.clone(), tx.clone());
        let second = Tunnel::client(info.clone(), tx.clone());
        let elsewhere = Tunnel::client(info.clone(), tx);

        mgr.new_tunnel(conn, first.clone()).await.unwrap();
        mgr.new_tunnel(conn, second.clone()).await.unwrap();
        mgr.new_tunnel(other, elsewhere.clone()).await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(mgr.tunnel_count(), 2);
        assert!(Arc::ptr_eq(&mgr.tunnel(conn, info.tunnel_id).unwrap(), &second));

        mgr.close(conn);
        mgr.close(conn);
        assert!(second.is_closed());
        assert!(!elsewhere.is_closed());
        assert_eq!(mgr.tunnel_count(), 1);
        assert_eq!(mgr.snapshot().len(), 1);

        mgr.close_all();
        assert!(elsewhere.is_closed());
        assert_eq!(mgr.tunnel_count(), 0);
    }

    async fn free_port(kind: TunnelKind) -> u16 {
        match kind {
            TunnelKind::Tcp => TcpListener::bind("0.0.0.0:0").await.unwrap().local_addr().unwrap().port(),
            TunnelKind::Udp => UdpSocket::bind("0.0.0.0:0").await.unwrap().local_addr().unwrap().port(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replacing_a_listening_tunnel_rebinds_its_fixed_port() {
        for kind in [TunnelKind::Tcp, TunnelKind::Udp] {
            let port = free_port(kind).await;
            let mgr = TunnelManager::new();
            let conn = mgr.next_conn_id();
            let (tx, mut rx) = control::channel();
            let info = TunnelInfo::new(kind, "127.0.0.1", 7000, port);

            let mut current = None;
            for round in 0..20 {
                let t = Tunnel::server(info.clone(), tx.clone(), mgr.pipe_ids());
                let res = mgr.new_tunnel(conn, t.clone()).await;
                assert!(res.is_ok(), "{kind} round {round}: {res:?}");
                assert_eq!(mgr.tunnel_count(), 1);
                assert_eq!(t.local_addr().unwrap().port(), port);
                if let Some(prev) = current.replace(t) {
                    assert!(prev.is_closed());
                }
            }

            // Only the last registration is serving the port.
            match kind {
                TunnelKind::Tcp => {
                    let _public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                    assert_eq!(next_connected_id(&mut rx).await, info.tunnel_id);
                }
                TunnelKind::Udp => {
                    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                    peer.send_to(b"x", ("127.0.0.1", port)).await.unwrap();
                    assert_eq!(next_connected_id(&mut rx).await, info.tunnel_id);
                }
            }
            mgr.close(conn);
        }
    }

    async fn next_connected_id(rx: &mut mpsc::UnboundedReceiver<Packet>) -> u32 {
        let p = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(p.command(), Some(Command::TunnelConnected));
        DataPacket::decode(p.data).unwrap().tunnel_id
    }

    /// Deliver everything queued on `rx` to `to` as if it came off the wire.
    fn wire(
        mut rx: mpsc::UnboundedReceiver<Packet>,
        to: Arc<TunnelManager>,
        conn: ConnId,
        tap: Option<mpsc::UnboundedSender<Packet>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(p) = rx.recv().await {
                if let Some(tap) = &tap {
                    let _ = tap.send(p.clone());
                }
                let _ = to.handle_packet(conn, &p);
            }
        })
    }

    async fn next_connected(tap: &mut mpsc::UnboundedReceiver<Packet>) -> u32 {
        loop {
            let p = tokio::time::timeout(WAIT, tap.recv()).await.unwrap().unwrap();
            if p.command() == Some(Command::TunnelConnected) {
                return DataPacket::decode(p.data).unwrap().pipe_id;
            }
        }
    }

    async fn recv(sock: &UdpSocket) -> (Vec<u8>, std::net::SocketAddr) {
        let mut buf = [0u8; 1500];
        let (n, from) = tokio::time::timeout(WAIT, sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (buf[..n].to_vec(), from)
    }

    #[tokio::test]
    async fn udp_pipe_closed_by_client_is_torn_down_on_both_ends() {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let info = TunnelInfo::new(
            TunnelKind::Udp,
            "127.0.0.1",
            target.local_addr().unwrap().port(),
            0,
        );
        let tid = info.tunnel_id;

        let server = Arc::new(TunnelManager::new());
        let client = Arc::new(TunnelManager::new());
        let (sconn, cconn) = (server.next_conn_id(), client.next_conn_id());
        let (s_tx, s_rx) = control::channel();
        let (c_tx, c_rx) = control::channel();
        let (tap_tx, mut tap) = mpsc::unbounded_channel();
        let _down = wire(s_rx, client.clone(), cconn, Some(tap_tx));
        let _up = wire(c_rx, server.clone(), sconn, None);

        server
            .new_tunnel(sconn, Tunnel::server(info.clone(), s_tx, server.pipe_ids()))
            .await
            .unwrap();
        client
            .new_tunnel(cconn, Tunnel::client(info, c_tx))
            .await
            .unwrap();
        let server_tunnel = server.tunnel(sconn, tid).unwrap();
        let client_tunnel = client.tunnel(cconn, tid).unwrap();
        let public = ("127.0.0.1", server_tunnel.local_addr().unwrap().port());

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"one", public).await.unwrap();
        let first_pipe = next_connected(&mut tap).await;
        let (got, relay) = recv(&target).await;
        assert_eq!(got, b"one");

        target.send_to(b"r1", relay).await.unwrap();
        assert_eq!(recv(&peer).await.0, b"r1");

        // Client-initiated teardown must reach the server's UDP session.
        client_tunnel.on_receive_tunnel_close(first_pipe);
        eventually(|| client_tunnel.pipe_count() == 0 && server_tunnel.pipe_count() == 0).await;

        peer.send_to(b"two", public).await.unwrap();
        let second_pipe = next_connected(&mut tap).await;
        assert_ne!(first_pipe, second_pipe);
        let (got, relay) = recv(&target).await;
        assert_eq!(got, b"two");

        target.send_to(b"r2", relay).await.unwrap();
        assert_eq!(recv(&peer).await.0, b"r2");

        server.close(sconn);
        client.close(cconn);
        assert_eq!(server.tunnel_count() + client.tunnel_count(), 0);
    }
}
