//! Virtual service client commands.

use crate::cli::parse_ip_port;
use crate::server::grpc::MerlinClient;
use crate::types::{
    Empty, Protocol, ServiceId, UInt32Value, VirtualService, VirtualServiceConfig,
    VirtualServiceKey,
};
use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};

#[derive(Args, Debug)]
pub struct ServiceArgs {
    /// Daemon to talk to.
    #[arg(long, default_value = "http://localhost:4282")]
    pub host: String,

    #[command(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ProtocolArg {
    Tcp,
    Udp,
}

impl From<ProtocolArg> for Protocol {
    fn from(value: ProtocolArg) -> Self {
        match value {
            ProtocolArg::Tcp => Protocol::Tcp,
            ProtocolArg::Udp => Protocol::Udp,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ServiceCommands {
    /// Create a virtual service.
    Add {
        id: String,
        #[arg(value_enum)]
        protocol: ProtocolArg,
        /// Endpoint as ip:port.
        endpoint: String,
        /// Kernel scheduler name, e.g. rr, wrr, sh.
        scheduler: String,
        /// Scheduler flags, comma delimited.
        #[arg(short, long, value_delimiter = ',')]
        flags: Vec<String>,
        /// Persistence window in seconds.
        #[arg(long)]
        persistence_timeout: Option<u32>,
    },
    /// Update fields of an existing virtual service.
    Edit {
        id: String,
        #[arg(long, value_enum)]
        protocol: Option<ProtocolArg>,
        /// Endpoint as ip:port; requires --protocol.
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        scheduler: Option<String>,
        #[arg(short, long, value_delimiter = ',')]
        flags: Option<Vec<String>>,
        #[arg(long)]
        persistence_timeout: Option<u32>,
    },
    /// Delete a virtual service and all of its servers.
    Delete { id: String },
    /// Show one virtual service.
    Get { id: String },
    /// List all virtual services.
    List,
}

pub async fn run_service(args: ServiceArgs) -> Result<()> {
    let mut client = MerlinClient::connect(args.host.clone())
        .await
        .with_context(|| format!("connecting to {}", args.host))?;

    match args.command {
        ServiceCommands::Add {
            id,
            protocol,
            endpoint,
            scheduler,
            flags,
            persistence_timeout,
        } => {
            let (ip, port) = parse_ip_port(&endpoint)?;
            let service = VirtualService {
                id,
                key: Some(VirtualServiceKey {
                    ip,
                    port,
                    protocol: Protocol::from(protocol) as i32,
                }),
                config: Some(VirtualServiceConfig {
                    scheduler,
                    flags,
                    persistence_timeout: persistence_timeout.map(UInt32Value::new),
                }),
                health_check: None,
            };
            client.create_service(service).await?;
            println!("service created");
        }
        ServiceCommands::Edit {
            id,
            protocol,
            endpoint,
            scheduler,
            flags,
            persistence_timeout,
        } => {
            let key = match (protocol, endpoint) {
                (Some(protocol), Some(endpoint)) => {
                    let (ip, port) = parse_ip_port(&endpoint)?;
                    Some(VirtualServiceKey {
                        ip,
                        port,
                        protocol: Protocol::from(protocol) as i32,
                    })
                }
                (None, None) => None,
                _ => bail!("--protocol and --endpoint must be given together"),
            };

            let config = if scheduler.is_some() || flags.is_some() || persistence_timeout.is_some()
            {
                Some(VirtualServiceConfig {
                    scheduler: scheduler.unwrap_or_default(),
                    flags: flags.unwrap_or_default(),
                    persistence_timeout: persistence_timeout.map(UInt32Value::new),
                })
            } else {
                None
            };

            client
                .update_service(VirtualService {
                    id,
                    key,
                    config,
                    health_check: None,
                })
                .await?;
            println!("service updated");
        }
        ServiceCommands::Delete { id } => {
            client.delete_service(ServiceId { id }).await?;
            println!("service deleted");
        }
        ServiceCommands::Get { id } => {
            let service = client.get_service(ServiceId { id }).await?.into_inner();
            println!("{}", format_service(&service));
        }
        ServiceCommands::List => {
            let list = client.list_services(Empty {}).await?.into_inner();
            for service in &list.services {
                println!("{}", format_service(service));
            }
        }
    }
    Ok(())
}

fn format_service(service: &VirtualService) -> String {
    let key = service
        .key
        .as_ref()
        .map(|k| k.to_string())
        .unwrap_or_else(|| "<no key>".to_string());
    let (scheduler, flags, persistence) = service
        .config
        .as_ref()
        .map(|c| {
            (
                c.scheduler.clone(),
                c.flags.join(","),
                c.persistence_timeout()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            )
        })
        .unwrap_or_default();
    format!(
        "{}\t{}\t{}\tflags=[{}]\tpersistence={}",
        service.id, key, scheduler, flags, persistence
    )
}
