pub mod admin;
pub mod app;
pub mod client;
pub mod config;
pub mod control;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod telemetry;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>, mode: app::Mode) -> anyhow::Result<()> {
    app::run(config_path, mode).await
}
