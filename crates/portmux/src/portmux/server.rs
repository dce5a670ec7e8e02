//! Server side of the control channel: accepts clients, checks their key and
//! opens a public listener for every tunnel they register.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::watch,
};

use crate::portmux::{
    control::{self, PacketReader, PacketSender},
    net,
    protocol::{Command, HelloRequest, HelloResponse, Packet},
    telemetry::{self, ControlConnGuard},
    tunnel::{
        forward::Tunnel,
        info::TunnelInfo,
        manager::{ConnId, TunnelManager},
    },
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Accepted auth keys. Empty accepts every client.
    pub valid_keys: Vec<String>,
    pub handshake_timeout: Duration,
    pub manager: Arc<TunnelManager>,
}

pub struct Server {
    opts: ServerOptions,
    keys: Arc<[String]>,
}

impl Server {
    pub fn new(mut opts: ServerOptions) -> anyhow::Result<Self> {
        if opts.listen_addr.trim().is_empty() {
            anyhow::bail!("server: listen_addr is required");
        }
        if opts.handshake_timeout.is_zero() {
            opts.handshake_timeout = DEFAULT_HANDSHAKE_TIMEOUT;
        }
        let keys: Arc<[String]> = opts
            .valid_keys
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Ok(Self { opts, keys })
    }

    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = net::normalize_bind_addr(&self.opts.listen_addr);
        TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("server: bind {addr}"))
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.bind().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(&self, ln: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %ln.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            keys = self.keys.len(),
            "server: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = ln.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "server: accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let conn = Connection {
                        mgr: self.opts.manager.clone(),
                        keys: self.keys.clone(),
                        handshake_timeout: self.opts.handshake_timeout,
                        peer,
                    };
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = conn.handle(stream, shutdown).await {
                            tracing::warn!(client = %peer, err = %err, "server: connection ended with error");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

/// An empty key list accepts everything.
pub fn is_authorized(valid_keys: &[String], key: &str) -> bool {
    valid_keys.is_empty() || valid_keys.iter().any(|k| k == key)
}

struct Connection {
    mgr: Arc<TunnelManager>,
    keys: Arc<[String]>,
    handshake_timeout: Duration,
    peer: SocketAddr,
}

impl Connection {
    async fn handle(self, stream: TcpStream, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let _active = ControlConnGuard::new();
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let (sender, writer) = control::spawn_writer(wr);
        let mut reader = PacketReader::new(rd);

        let first = match tokio::time::timeout(self.handshake_timeout, reader.next_packet()).await {
            Ok(res) => res?,
            Err(_) => {
                tracing::warn!(client = %self.peer, "server: handshake timed out");
                return Ok(());
            }
        };
        let Some(first) = first else {
            return Ok(());
        };
        if first.command() != Some(Command::Hello) {
            tracing::warn!(client = %self.peer, cmd = first.cmd, "server: expected hello");
            return Ok(());
        }

        let hello: HelloRequest = first.parse_json().unwrap_or_default();
        let authed = is_authorized(&self.keys, &hello.auth_key);
        sender.send(Packet::json(Command::Hello, &HelloResponse { is_authed: authed })?);
        if !authed {
            telemetry::record_auth_failure();
            tracing::warn!(client = %self.peer, "server: bad auth key");
            // Let the rejection reach the client before the socket closes.
            drop(sender);
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
            return Ok(());
        }

        let conn = self.mgr.next_conn_id();
        tracing::info!(conn = %conn, client = %self.peer, "server: client connected");

        let res = self.serve_packets(conn, &sender, &mut reader, shutdown).await;

        self.mgr.close(conn);
        writer.abort();
        tracing::info!(conn = %conn, client = %self.peer, "server: client disconnected");
        res
    }

    async fn serve_packets(
        &self,
        conn: ConnId,
        sender: &PacketSender,
        reader: &mut PacketReader<OwnedReadHalf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            let packet = tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                p = reader.next_packet() => p?,
            };
            let Some(packet) = packet else {
                return Ok(());
            };

            match packet.command() {
                Some(Command::Hello) => {
                    sender.send(Packet::json(Command::Hello, &HelloResponse { is_authed: true })?);
                }
                Some(Command::Heartbeat) => {
                    tracing::trace!(conn = %conn, "server: heartbeat");
                }
                Some(Command::NewTunnel) => self.register_tunnels(conn, sender, &packet).await,
                _ => match self.mgr.handle_packet(conn, &packet) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(conn = %conn, cmd = packet.cmd, "server: ignoring unknown command");
                    }
                    Err(err) => {
                        tracing::debug!(conn = %conn, cmd = packet.cmd, err = %err, "server: bad packet");
                    }
                },
            }
        }
    }

    async fn register_tunnels(&self, conn: ConnId, sender: &PacketSender, packet: &Packet) {
        let infos: Vec<TunnelInfo> = match packet.parse_json() {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(conn = %conn, err = %err, "server: bad tunnel list");
                return;
            }
        };
        for info in infos {
            let info = info.normalize();
            if info.is_local_tunnel {
                continue;
            }
            let tunnel = Tunnel::server(info, sender.clone(), self.mgr.pipe_ids());
            if let Err(err) = self.mgr.new_tunnel(conn, tunnel).await {
                tracing::warn!(conn = %conn, err = %err, "server: tunnel not started");
            }
        }
    }
}
