//! Command-line interface.
//!
//! One binary: `merlin start` runs the daemon; `merlin service …` and
//! `merlin server …` are thin clients over the RPC surface.

pub mod commands;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use std::sync::OnceLock;

/// Merlin - distributed IPVS manager.
#[derive(Parser, Debug)]
#[command(name = "merlin")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the merlin daemon.
    Start(commands::StartArgs),
    /// Manage virtual services.
    Service(commands::ServiceArgs),
    /// Manage real servers.
    Server(commands::ServerArgs),
}

static IP_PORT: OnceLock<Regex> = OnceLock::new();

/// Quick shape check for `ip:port` arguments. The daemon's validator
/// performs the authoritative parsing.
pub fn parse_ip_port(input: &str) -> Result<(String, u32)> {
    let regex = IP_PORT.get_or_init(|| Regex::new(r"^([^:]+):(\d+)$").expect("static regex"));
    let caps = regex
        .captures(input)
        .ok_or_else(|| anyhow!("expected ip:port, got {input:?}"))?;
    let port: u32 = caps[2]
        .parse()
        .with_context(|| format!("port in {input:?}"))?;
    Ok((caps[1].to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_port_shapes_are_accepted() {
        assert_eq!(
            parse_ip_port("10.10.10.1:101").unwrap(),
            ("10.10.10.1".to_string(), 101)
        );
        // The pre-filter passes anything host-shaped through; validation
        // happens server-side.
        assert!(parse_ip_port("not-an-ip:80").is_ok());
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        for input in ["10.0.0.1", "10.0.0.1:", ":80", "10.0.0.1:80:90", "a:b"] {
            assert!(parse_ip_port(input).is_err(), "{input:?} should be rejected");
        }
    }
}
