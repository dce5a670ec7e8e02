mod portmux;

use clap::{Parser, Subcommand};

use crate::portmux::app::Mode;

#[derive(Debug, Parser)]
#[command(
    name = "portmux",
    version,
    about = "portmux - reverse TCP/UDP port forwarding over one multiplexed connection"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses PORTMUX_CONFIG; then auto-detects portmux.toml > portmux.yaml > portmux.yml from CWD; then falls back to the OS default path (Linux: /etc/portmux/portmux.toml; others: user config dir).
    #[arg(long, env = "PORTMUX_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept clients and open the public ports they ask for.
    Server,
    /// Connect to a server and forward its public ports to local targets.
    Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Command::Server => Mode::Server,
        Command::Client => Mode::Client,
    };
    portmux::run(cli.config, mode).await
}
