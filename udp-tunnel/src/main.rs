//! udp-tunnel: carry request/reply UDP traffic over an ssh tunnel
//!
//! `connect` is the usual entry point: it starts `ssh`, which launches
//! `udp-tunnel remote` on the far host, and serves the local side until a
//! termination signal arrives. `local` and `remote` run one side each.

use clap::{Parser, Subcommand};

mod cli;

#[derive(Parser)]
#[command(name = "udp-tunnel")]
#[command(about = "Relay request/reply UDP traffic through an ssh tunnel")]
#[command(version)]
struct Cli {
    /// Log filter such as `debug` or `udp_tunnel=trace` (defaults to RUST_LOG, then `info`)
    #[arg(long, global = true, env = "UDP_TUNNEL_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ssh tunnel and the local relay, and stop the remote relay on exit
    Connect(cli::connect::ConnectArgs),
    /// Run only the local relay, for a tunnel managed elsewhere
    Local(cli::LocalArgs),
    /// Run the remote relay (launched on the far host by `connect`)
    Remote(cli::remote::RemoteArgs),
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.log.as_deref());

    match cli.command {
        Commands::Connect(args) => cli::connect::run(args).await,
        Commands::Local(args) => cli::local::run(args).await,
        Commands::Remote(args) => cli::remote::run(args).await,
    }
}
