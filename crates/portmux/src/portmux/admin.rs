use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::portmux::{telemetry, tunnel::manager::TunnelManager};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub manager: Arc<TunnelManager>,
    pub mode: &'static str,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnels", get(tunnels))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("admin: bind {addr}"))?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("admin: serve")
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    mode: &'static str,
    tunnels: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            mode: st.mode,
            tunnels: st.manager.tunnel_count(),
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.manager.snapshot()))
}

#[cfg(test)]
mod tests {
    use axum::{body::to_bytes, response::Response};
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;
    use crate::portmux::tunnel::{
        forward::Tunnel,
        info::{TunnelInfo, TunnelKind},
    };

    fn state() -> Arc<AdminState> {
        let prom = PrometheusBuilder::new().build_recorder().handle();
        Arc::new(AdminState {
            prom: Arc::new(prom),
            manager: Arc::new(TunnelManager::new()),
            mode: "server",
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_mode() {
        let v = body_json(health(State(state())).await.into_response()).await;
        assert_eq!(v["ok"], true);
        assert_eq!(v["mode"], "server");
        assert_eq!(v["tunnels"], 0);
    }

    #[tokio::test]
    async fn tunnels_lists_registered_rules() {
        let st = state();
        let conn = st.manager.next_conn_id();
        let info = TunnelInfo::new(TunnelKind::Tcp, "127.0.0.1", 22, 0).local();
        let tunnel = Tunnel::local(info, st.manager.pipe_ids());
        st.manager.new_tunnel(conn, tunnel).await.unwrap();

        let v = body_json(tunnels(State(st.clone())).await.into_response()).await;
        let list = v.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["type"], "tcp");
        assert_eq!(list[0]["role"], "local");
        assert_eq!(list[0]["target"], "127.0.0.1:22");
        assert_eq!(list[0]["pipes"], 0);
        st.manager.close(conn);
    }

    #[tokio::test]
    async fn metrics_is_prometheus_text() {
        let resp = metrics(State(state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(ct.to_str().unwrap().starts_with("text/plain"));
    }
}
