mod cli;

use crate::cli::args::Args;
use clap::Parser;
use identd_server::logging::init_logging;
use identd_server::port_mapper::gateway::{IgdGateway, PortGateway};
use identd_server::{IdentdServer, PortMapper};
use log::{error, info, warn};
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::ctrl_c;
use tokio::time::sleep;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_config.as_deref()).unwrap_or_else(|error| {
        eprintln!("Failed to initialize logging: {error:#}");
        exit(1);
    });

    info!("Starting identd-server {SERVER_VERSION} with {args:?}");

    let port_mapper = if args.no_upnp {
        PortMapper::disabled()
    } else {
        let discovery_timeout = args.discovery_timeout;
        PortMapper::spawn(move || {
            IgdGateway::discover(discovery_timeout).map(|gateway| Arc::new(gateway) as Arc<dyn PortGateway>)
        })
    };

    let server = IdentdServer::new(args.server_config(), port_mapper);
    if let Err(error) = server.start().await {
        error!("{error}");
        exit(1);
    }
    for user in &args.users {
        if let Err(error) = server.add_user(&user.username, user.local_port, user.peer_addr) {
            warn!("Failed to register {}: {error}", user.username);
        }
    }

    wait_for_shutdown(args.shutdown_time).await;
    server.stop().await;
}

async fn wait_for_shutdown(shutdown_time: Option<Duration>) {
    let deadline = async {
        match shutdown_time {
            Some(shutdown_time) => {
                info!("Automatically shutting down after {shutdown_time:?}");
                sleep(shutdown_time).await;
                info!("Shutting down because shutdown_time ({shutdown_time:?}) was reached");
            }
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(error) => error!("Failed to listen for Ctrl-C, shutting down: {error}"),
        },
        _ = deadline => {}
    }
}
