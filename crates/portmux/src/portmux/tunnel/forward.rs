use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use bytes::Bytes;
use serde::Serialize;

use crate::portmux::{
    control::PacketSender,
    net,
    protocol::{Command, DataPacket, Packet},
    socket::{
        NewConnectFn, SharedListener,
        tcp::{TcpClient, TcpServer},
        udp::{UdpClient, UdpServer},
    },
    tunnel::{
        endpoint::{EndPoint, SharedEndPoint},
        info::{TunnelInfo, TunnelKind},
        manager::PipeIdAllocator,
        pipe::Pipe,
        virtual_endpoint::VirtualEndpoint,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the public listener; originates pipes.
    Server,
    /// Dials the target when the server reports a new pipe.
    Client,
    /// Listener and target on the same host; no control connection.
    Local,
}

struct PipeEntry {
    pipe: Arc<Pipe>,
    virt: Option<Arc<VirtualEndpoint>>,
}

#[derive(Default)]
struct TunnelState {
    pipes: HashMap<u32, PipeEntry>,
    closed: bool,
}

/// Runtime state of one forwarding rule: its listener (server and local
/// roles) and the live pipes keyed by pipe id.
pub struct Tunnel {
    info: TunnelInfo,
    role: Role,
    sender: Option<PacketSender>,
    pipe_ids: Option<Arc<PipeIdAllocator>>,
    listener: Mutex<Option<SharedListener>>,
    state: Mutex<TunnelState>,
    me: Weak<Tunnel>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("tunnel_id", &self.info.tunnel_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub fn server(info: TunnelInfo, sender: PacketSender, pipe_ids: Arc<PipeIdAllocator>) -> Arc<Self> {
        Self::build(info, Role::Server, Some(sender), Some(pipe_ids))
    }

    pub fn client(info: TunnelInfo, sender: PacketSender) -> Arc<Self> {
        Self::build(info, Role::Client, Some(sender), None)
    }

    pub fn local(info: TunnelInfo, pipe_ids: Arc<PipeIdAllocator>) -> Arc<Self> {
        Self::build(info, Role::Local, None, Some(pipe_ids))
    }

    fn build(
        info: TunnelInfo,
        role: Role,
        sender: Option<PacketSender>,
        pipe_ids: Option<Arc<PipeIdAllocator>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            info,
            role,
            sender,
            pipe_ids,
            listener: Mutex::new(None),
            state: Mutex::new(TunnelState::default()),
            me: me.clone(),
        })
    }

    pub fn info(&self) -> &TunnelInfo {
        &self.info
    }

    pub fn id(&self) -> u32 {
        self.info.tunnel_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pipe_count(&self) -> usize {
        self.lock().pipes.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Address the listener actually bound (server and local roles).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener().and_then(|l| l.local_addr())
    }

    /// Server and local roles bind `source_port`; the client role has nothing
    /// to set up.
    pub async fn start(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.role == Role::Client {
            return true;
        }

        let listener = self.make_listener();
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener.clone());

        if !listener.start().await {
            tracing::warn!(
                tunnel_id = self.id(),
                kind = %self.info.kind,
                source_port = self.info.source_port,
                "tunnel: listen failed"
            );
            return false;
        }
        // close() may have run while we were binding.
        if self.is_closed() {
            listener.close();
            return false;
        }

        tracing::info!(
            tunnel_id = self.id(),
            role = ?self.role,
            kind = %self.info.kind,
            source_port = self.info.source_port,
            target = %self.info.target(),
            "tunnel: listening"
        );
        true
    }

    fn make_listener(&self) -> SharedListener {
        let me = self.me.clone();
        let on_new_connect: NewConnectFn = Arc::new(move |ep: SharedEndPoint| match me.upgrade() {
            Some(t) => t.on_listener_new_connect(ep),
            None => ep.close(),
        });
        let bind = net::any_port(self.info.source_port);
        match self.info.kind {
            TunnelKind::Tcp => TcpServer::new(bind, on_new_connect),
            TunnelKind::Udp => UdpServer::new(
                bind,
                Duration::from_secs(self.info.timeout),
                on_new_connect,
            ),
        }
    }

    fn make_target(&self) -> SharedEndPoint {
        match self.info.kind {
            TunnelKind::Tcp => TcpClient::new(self.info.target()),
            TunnelKind::Udp => UdpClient::new(self.info.target()),
        }
    }

    fn on_listener_new_connect(&self, ep: SharedEndPoint) {
        let Some(pipe_ids) = &self.pipe_ids else {
            ep.close();
            return;
        };

        let pipe = {
            let mut st = self.lock();
            if st.closed {
                drop(st);
                // Nothing was announced for this connection yet.
                ep.close();
                return;
            }
            let pipe_id = pipe_ids.next();
            let (pipe, virt) = match (&self.role, &self.sender) {
                (Role::Server, Some(sender)) => {
                    let virt = VirtualEndpoint::new(self.id(), pipe_id, sender.clone());
                    (Pipe::new(pipe_id, virt.clone(), ep), Some(virt))
                }
                _ => (Pipe::new(pipe_id, self.make_target(), ep), None),
            };
            st.pipes.insert(
                pipe_id,
                PipeEntry {
                    pipe: pipe.clone(),
                    virt,
                },
            );
            // Queued under the lock so a concurrent close() can only follow it.
            if let Some(sender) = &self.sender {
                let dp = DataPacket::header_only(self.id(), pipe_id);
                sender.send(Packet::data_packet(Command::TunnelConnected, &dp));
            }
            pipe
        };
        self.watch_close(&pipe);
        self.spawn_link(pipe);
    }

    /// Client role: the server announced `pipe_id`. Opens the real connection
    /// to the target and pairs it with a virtual endpoint. `false` for a pipe
    /// id already in use (no second connection is attempted) or a closed
    /// tunnel.
    pub fn on_client_new_connect(&self, pipe_id: u32) -> bool {
        let (Role::Client, Some(sender)) = (self.role, &self.sender) else {
            return false;
        };

        let pipe = {
            let mut st = self.lock();
            if st.closed {
                return false;
            }
            if st.pipes.contains_key(&pipe_id) {
                tracing::debug!(tunnel_id = self.id(), pipe_id, "tunnel: duplicate pipe id rejected");
                return false;
            }
            // Nothing below touches the network until link().
            let virt = VirtualEndpoint::new(self.id(), pipe_id, sender.clone());
            let pipe = Pipe::new(pipe_id, self.make_target(), virt.clone());
            st.pipes.insert(
                pipe_id,
                PipeEntry {
                    pipe: pipe.clone(),
                    virt: Some(virt),
                },
            );
            pipe
        };
        self.watch_close(&pipe);
        self.spawn_link(pipe);
        true
    }

    pub fn on_receive_tunnel_data(&self, pipe_id: u32, data: Bytes) {
        let virt = self
            .lock()
            .pipes
            .get(&pipe_id)
            .and_then(|e| e.virt.clone());
        match virt {
            Some(v) => v.on_receive_data(data),
            None => tracing::trace!(tunnel_id = self.id(), pipe_id, "tunnel: data for unknown pipe"),
        }
    }

    pub fn on_receive_tunnel_close(&self, pipe_id: u32) {
        let pipe = self.lock().pipes.get(&pipe_id).map(|e| e.pipe.clone());
        if let Some(p) = pipe {
            p.close();
        }
    }

    /// Clears the pipe table before closing anything so teardown callbacks
    /// find nothing to remove. Repeat calls are no-ops. See [`Tunnel::wait_closed`].
    pub fn close(&self) {
        let pipes = {
            let mut st = self.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            std::mem::take(&mut st.pipes)
        };
        let listener = self.listener();

        let n = pipes.len();
        for (_, e) in pipes {
            e.pipe.close();
        }
        if let Some(l) = listener {
            l.close();
        }
        tracing::debug!(tunnel_id = self.id(), pipes = n, "tunnel: closed");
    }

    /// Resolves once the listening socket is released. Call after `close`
    /// before binding the same `source_port` again.
    pub async fn wait_closed(&self) {
        if let Some(l) = self.listener() {
            l.wait_closed().await;
        }
    }

    fn listener(&self) -> Option<SharedListener> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn watch_close(&self, pipe: &Arc<Pipe>) {
        let me = self.me.clone();
        let pipe_id = pipe.id();
        let weak_pipe = Arc::downgrade(pipe);
        pipe.on_close(move || {
            if let Some(t) = me.upgrade() {
                t.remove_pipe(pipe_id, &weak_pipe);
            }
        });
    }

    fn remove_pipe(&self, pipe_id: u32, pipe: &Weak<Pipe>) {
        let mut st = self.lock();
        let same = st
            .pipes
            .get(&pipe_id)
            .is_some_and(|e| std::ptr::eq(Arc::as_ptr(&e.pipe), pipe.as_ptr()));
        if same {
            st.pipes.remove(&pipe_id);
        }
    }

    fn spawn_link(&self, pipe: Arc<Pipe>) {
        let tunnel_id = self.id();
        tokio::spawn(async move {
            if !pipe.link().await {
                tracing::debug!(tunnel_id, pipe_id = pipe.id(), "tunnel: pipe failed to start");
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
