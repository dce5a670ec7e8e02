use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// Call once per process, before any tunnel starts.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Counts a control connection for as long as it is held.
pub struct ControlConnGuard;

impl ControlConnGuard {
    pub fn new() -> Self {
        metrics::counter!("portmux_control_connections_total").increment(1);
        metrics::gauge!("portmux_control_connections_active").increment(1.0);
        Self
    }
}

impl Drop for ControlConnGuard {
    fn drop(&mut self) {
        metrics::gauge!("portmux_control_connections_active").decrement(1.0);
    }
}

pub fn record_auth_failure() {
    metrics::counter!("portmux_auth_failures_total").increment(1);
}
