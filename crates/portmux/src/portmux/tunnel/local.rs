//! Rules marked `local`: both the listener and the target live on this host,
//! so no control connection is involved.

use std::sync::Arc;

use tokio::sync::watch;

use crate::portmux::tunnel::{
    forward::Tunnel,
    info::TunnelInfo,
    manager::{ConnId, TunnelManager},
};

/// Start every rule under `conn`. Returns how many came up; failures are
/// logged and skipped.
pub async fn start_local_tunnels(mgr: &TunnelManager, conn: ConnId, infos: &[TunnelInfo]) -> usize {
    let mut started = 0;
    for info in infos {
        let info = info.clone().normalize();
        let source_port = info.source_port;
        let target = info.target();
        let tunnel = Tunnel::local(info, mgr.pipe_ids());
        match mgr.new_tunnel(conn, tunnel).await {
            Ok(()) => {
                started += 1;
                tracing::info!(source_port, target = %target, "local: forwarding");
            }
            Err(err) => tracing::warn!(err = %err, target = %target, "local: tunnel failed"),
        }
    }
    started
}

/// Serve local rules until shutdown.
pub async fn run(
    mgr: Arc<TunnelManager>,
    infos: Vec<TunnelInfo>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let conn = mgr.next_conn_id();
    let started = start_local_tunnels(&mgr, conn, &infos).await;
    if started == 0 && !infos.is_empty() {
        anyhow::bail!("local: none of {} local tunnels could be started", infos.len());
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    mgr.close(conn);
    Ok(())
}
