//! Client side of the control channel: logs in, registers its remote tunnels
//! and serves pipe traffic until the connection ends. There is no reconnect.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::watch,
    time::MissedTickBehavior,
};

use crate::portmux::{
    control::{self, PacketReader, PacketSender},
    protocol::{Command, HelloRequest, HelloResponse, Packet},
    tunnel::{
        forward::Tunnel,
        info::TunnelInfo,
        manager::{ConnId, TunnelManager},
    },
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub auth_key: String,
    /// Rules forwarded through the server. Entries marked local are skipped.
    pub tunnels: Vec<TunnelInfo>,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub manager: Arc<TunnelManager>,
}

pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        opts.server_addr = opts.server_addr.trim().to_string();
        if opts.server_addr.is_empty() {
            anyhow::bail!("client: server_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if opts.heartbeat_interval.is_zero() {
            opts.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        }
        opts.tunnels = opts
            .tunnels
            .drain(..)
            .map(TunnelInfo::normalize)
            .filter(|t| !t.is_local_tunnel)
            .collect();
        Ok(Self { opts })
    }

    #[cfg(test)]
    pub fn manager(&self) -> Arc<TunnelManager> {
        self.opts.manager.clone()
    }

    /// Connect, authenticate and serve until the server goes away or
    /// `shutdown` fires. A rejected key is an error.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let server = &self.opts.server_addr;
        let stream = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(server))
            .await
            .with_context(|| format!("client: dial {server} timed out"))?
            .with_context(|| format!("client: dial {server}"))?;
        let _ = stream.set_nodelay(true);
        let (rd, wr) = stream.into_split();
        let (sender, writer) = control::spawn_writer(wr);
        let mut reader = PacketReader::new(rd);

        let res = self.login(&sender, &mut reader).await;
        if let Err(err) = res {
            writer.abort();
            return Err(err);
        }

        let mgr = &self.opts.manager;
        let conn = mgr.next_conn_id();
        let res = self.serve(conn, &sender, &mut reader, shutdown).await;

        mgr.close(conn);
        writer.abort();
        tracing::info!(server = %server, "client: disconnected");
        res
    }

    async fn login(&self, sender: &PacketSender, reader: &mut PacketReader<OwnedReadHalf>) -> anyhow::Result<()> {
        let hello = HelloRequest {
            auth_key: self.opts.auth_key.clone(),
        };
        sender.send(Packet::json(Command::Hello, &hello)?);

        let reply = tokio::time::timeout(self.opts.dial_timeout, reader.next_packet())
            .await
            .context("client: handshake timed out")??;
        let Some(reply) = reply else {
            anyhow::bail!("client: server closed the connection during handshake");
        };
        if reply.command() != Some(Command::Hello) {
            anyhow::bail!("client: unexpected handshake reply (cmd {})", reply.cmd);
        }
        let resp: HelloResponse = reply.parse_json().context("client: decode hello reply")?;
        if !resp.is_authed {
            anyhow::bail!("client: server rejected the auth key");
        }
        Ok(())
    }

    async fn serve(
        &self,
        conn: ConnId,
        sender: &PacketSender,
        reader: &mut PacketReader<OwnedReadHalf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mgr = &self.opts.manager;
        if !self.opts.tunnels.is_empty() {
            sender.send(Packet::json(Command::NewTunnel, &self.opts.tunnels)?);
        }
        for info in &self.opts.tunnels {
            mgr.new_tunnel(conn, Tunnel::client(info.clone(), sender.clone()))
                .await
                .context("client: register tunnel")?;
        }
        tracing::info!(
            conn = %conn,
            server = %self.opts.server_addr,
            tunnels = self.opts.tunnels.len(),
            "client: connected"
        );

        let mut heartbeat = tokio::time::interval(self.opts.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = heartbeat.tick() => {
                    if !sender.send(Packet::empty(Command::Heartbeat)) {
                        return Ok(());
                    }
                }
                p = reader.next_packet() => {
                    let Some(packet) = p? else {
                        return Ok(());
                    };
                    match packet.command() {
                        Some(Command::Hello | Command::Heartbeat) => {
                            tracing::trace!(conn = %conn, cmd = packet.cmd, "client: control packet");
                        }
                        _ => match mgr.handle_packet(conn, &packet) {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::debug!(conn = %conn, cmd = packet.cmd, "client: ignoring unknown command");
                            }
                            Err(err) => {
                                tracing::debug!(conn = %conn, cmd = packet.cmd, err = %err, "client: bad packet");
                            }
                        },
                    }
                }
            }
        }
    }
}
