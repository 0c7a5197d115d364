use crate::cli::parser::{DurationValueParser, UserSpec};
use clap::Parser;
use identd_server::IdentdConfig;
use identd_server::config::IDENT_PORT;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port to listen on. 0 picks any available port.
    #[arg(short, long, default_value_t = 0)]
    pub port: u16,

    /// Port to forward from the gateway
    #[arg(short = 'e', long, default_value_t = IDENT_PORT)]
    pub external_port: u16,

    /// How long a registered user stays answerable. Also the port mapping lease.
    #[arg(long, value_parser = DurationValueParser, default_value = "180s")]
    pub ttl: Duration,

    /// How long a client may take to send its query
    #[arg(long, value_parser = DurationValueParser, default_value = "30s")]
    pub read_timeout: Duration,

    /// Don't look for a UPnP gateway
    #[arg(long)]
    pub no_upnp: bool,

    /// How long to search for a UPnP gateway
    #[arg(long, value_parser = DurationValueParser, default_value = "10s")]
    pub discovery_timeout: Duration,

    /// A user to register at startup, as username,local-port,peer-address. May be repeated.
    #[arg(short, long = "user")]
    pub users: Vec<UserSpec>,

    /// The amount of time before the server automatically shuts down. Useful for restart scripts.
    #[arg(long, value_parser = DurationValueParser)]
    pub shutdown_time: Option<Duration>,

    /// The path to a log4rs yaml logging configuration
    #[arg(long)]
    pub log_config: Option<PathBuf>,
}

impl Args {
    pub fn server_config(&self) -> IdentdConfig {
        IdentdConfig {
            bind_addr: self.bind,
            port: self.port,
            external_port: self.external_port,
            user_ttl: self.ttl,
            read_timeout: self.read_timeout,
            ..Default::default()
        }
    }
}
