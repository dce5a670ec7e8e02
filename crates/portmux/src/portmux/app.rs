use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::portmux::{
    admin,
    client::{Client, ClientOptions},
    config, logging, net,
    server::{Server, ServerOptions},
    telemetry,
    tunnel::{self, info::TunnelInfo, manager::TunnelManager},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Server => "server",
            Mode::Client => "client",
        }
    }
}

pub async fn run(config_path: Option<PathBuf>, mode: Mode) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let (local_tunnels, remote_tunnels): (Vec<TunnelInfo>, Vec<TunnelInfo>) =
        cfg.tunnels.iter().cloned().partition(|t| t.is_local_tunnel);

    if mode == Mode::Client && cfg.tunnels.is_empty() {
        anyhow::bail!("config: client has nothing to forward (add [[tunnels]] entries)");
    }

    tracing::info!(
        mode = mode.as_str(),
        config = %resolved.path.display(),
        admin_addr = %cfg.admin_addr,
        remote_tunnels = remote_tunnels.len(),
        local_tunnels = local_tunnels.len(),
        "portmux: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let manager = Arc::new(TunnelManager::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if !cfg.admin_addr.trim().is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            manager: manager.clone(),
            mode: mode.as_str(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    match mode {
        Mode::Server => {
            tracing::info!(
                listen_addr = %cfg.server.listen_addr,
                handshake_timeout = %humantime::format_duration(cfg.server.handshake_timeout),
                "server: configured"
            );
            let server = Server::new(ServerOptions {
                listen_addr: cfg.server.listen_addr.clone(),
                valid_keys: cfg.server.valid_keys.clone(),
                handshake_timeout: cfg.server.handshake_timeout,
                manager: manager.clone(),
            })?;
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { server.listen_and_serve(shutdown).await });
        }
        Mode::Client => {
            if !local_tunnels.is_empty() {
                let shutdown = shutdown_rx.clone();
                let mgr = manager.clone();
                tasks.spawn(async move { tunnel::local::run(mgr, local_tunnels, shutdown).await });
            }
            if !remote_tunnels.is_empty() {
                tracing::info!(
                    server_addr = %cfg.client.server_addr,
                    dial_timeout = %humantime::format_duration(cfg.client.dial_timeout),
                    heartbeat = %humantime::format_duration(cfg.client.heartbeat_interval),
                    "client: configured"
                );
                let client = Client::new(ClientOptions {
                    server_addr: cfg.client.server_addr.clone(),
                    auth_key: cfg.client.auth_key.clone(),
                    tunnels: remote_tunnels,
                    dial_timeout: cfg.client.dial_timeout,
                    heartbeat_interval: cfg.client.heartbeat_interval,
                    manager: manager.clone(),
                })?;
                let shutdown = shutdown_rx.clone();
                tasks.spawn(async move { client.run(shutdown).await });
            }
        }
    }

    // Any task ending (including the client losing its server) stops the process.
    let res = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        },
    };
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not stop in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    manager.close_all();
    res
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
