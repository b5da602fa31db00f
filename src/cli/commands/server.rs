//! Real server client commands.

use crate::cli::parse_ip_port;
use crate::server::grpc::MerlinClient;
use crate::types::{
    ForwardMethod, RealServer, RealServerConfig, RealServerKey, ServiceId, UInt32Value,
};
use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Daemon to talk to.
    #[arg(long, default_value = "http://localhost:4282")]
    pub host: String,

    #[command(subcommand)]
    pub command: ServerCommands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ForwardArg {
    Route,
    Tunnel,
    Masq,
}

impl From<ForwardArg> for ForwardMethod {
    fn from(value: ForwardArg) -> Self {
        match value {
            ForwardArg::Route => ForwardMethod::Route,
            ForwardArg::Tunnel => ForwardMethod::Tunnel,
            ForwardArg::Masq => ForwardMethod::Masq,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ServerCommands {
    /// Attach a real server to a virtual service.
    Add {
        service_id: String,
        /// Backend as ip:port.
        endpoint: String,
        /// Scheduling weight; 0 drains the server.
        #[arg(short, long)]
        weight: u32,
        #[arg(short, long, value_enum)]
        forward: ForwardArg,
    },
    /// Update fields of an existing real server.
    Edit {
        service_id: String,
        endpoint: String,
        #[arg(short, long)]
        weight: Option<u32>,
        #[arg(short, long, value_enum)]
        forward: Option<ForwardArg>,
    },
    /// Detach a real server.
    Delete {
        service_id: String,
        endpoint: String,
    },
    /// List the real servers of a virtual service.
    List { service_id: String },
}

pub async fn run_server(args: ServerArgs) -> Result<()> {
    let mut client = MerlinClient::connect(args.host.clone())
        .await
        .with_context(|| format!("connecting to {}", args.host))?;

    match args.command {
        ServerCommands::Add {
            service_id,
            endpoint,
            weight,
            forward,
        } => {
            let (ip, port) = parse_ip_port(&endpoint)?;
            client
                .create_server(RealServer {
                    service_id,
                    key: Some(RealServerKey { ip, port }),
                    config: Some(RealServerConfig {
                        weight: Some(UInt32Value::new(weight)),
                        forward: ForwardMethod::from(forward) as i32,
                    }),
                })
                .await?;
            println!("server created");
        }
        ServerCommands::Edit {
            service_id,
            endpoint,
            weight,
            forward,
        } => {
            let (ip, port) = parse_ip_port(&endpoint)?;
            client
                .update_server(RealServer {
                    service_id,
                    key: Some(RealServerKey { ip, port }),
                    config: Some(RealServerConfig {
                        weight: weight.map(UInt32Value::new),
                        forward: forward
                            .map(|f| ForwardMethod::from(f) as i32)
                            .unwrap_or(ForwardMethod::Unset as i32),
                    }),
                })
                .await?;
            println!("server updated");
        }
        ServerCommands::Delete {
            service_id,
            endpoint,
        } => {
            let (ip, port) = parse_ip_port(&endpoint)?;
            client
                .delete_server(RealServer {
                    service_id,
                    key: Some(RealServerKey { ip, port }),
                    config: None,
                })
                .await?;
            println!("server deleted");
        }
        ServerCommands::List { service_id } => {
            let list = client.list_servers(ServiceId { id: service_id }).await?.into_inner();
            for server in &list.servers {
                println!("{}", format_server(server));
            }
        }
    }
    Ok(())
}

fn format_server(server: &RealServer) -> String {
    let key = server
        .key
        .as_ref()
        .map(|k| k.to_string())
        .unwrap_or_else(|| "<no key>".to_string());
    let (weight, forward) = server
        .config
        .as_ref()
        .map(|c| {
            (
                c.weight().map(|w| w.to_string()).unwrap_or_else(|| "-".to_string()),
                c.forward()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )
        })
        .unwrap_or_else(|| ("-".to_string(), "-".to_string()));
    format!("{}\tweight={}\tforward={}", key, weight, forward)
}
