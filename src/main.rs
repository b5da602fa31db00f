//! Merlin - unified CLI entrypoint.
//!
//! Usage:
//!   merlin start --store-backend etcd3 --store-endpoints http://etcd:2379
//!   merlin service add service1 tcp 10.10.10.1:101 sh -f sh-port
//!   merlin service list
//!   merlin server add service1 172.16.1.1:8080 -w 2 -f route
//!   merlin server list service1

use anyhow::Result;
use clap::Parser;
use merlin::cli::commands::{run_server, run_service, run_start};
use merlin::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Service(args) => run_service(args).await,
        Commands::Server(args) => run_server(args).await,
    }
}
