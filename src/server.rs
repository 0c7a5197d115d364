use crate::config::IdentdConfig;
use crate::error::IdentdError;
use crate::port_mapper::PortMapper;
use crate::port_mapper::event::MappingEvent;
use crate::port_mapper::gateway::{MappingRequest, Protocol};
use crate::protocol::handle_connection;
use crate::registry::UserRegistry;
use log::{debug, error, info};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ServerStatus {
    Idle,
    Starting,
    Running(SocketAddr),
    Stopped,
}

/// An identd responder embedded in a host application.
///
/// The host registers the local port of every outbound connection it makes with
/// [`IdentdServer::add_user`]; the first ident query for that port within the TTL is answered
/// with the username, and the gateway is asked to forward the ident port here for as long.
pub struct IdentdServer {
    config: IdentdConfig,
    registry: Arc<UserRegistry>,
    port_mapper: Arc<PortMapper>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    runtime: OnceLock<Handle>,
    status: Mutex<ServerStatus>,
}

impl IdentdServer {
    pub fn new(config: IdentdConfig, port_mapper: PortMapper) -> Self {
        Self {
            config,
            registry: Arc::new(UserRegistry::new()),
            port_mapper: Arc::new(port_mapper),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            runtime: OnceLock::new(),
            status: Mutex::new(ServerStatus::Idle),
        }
    }

    /// Binds the listener and starts accepting ident queries. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, IdentdError> {
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            if *status != ServerStatus::Idle {
                return Err(IdentdError::AlreadyStarted);
            }
            *status = ServerStatus::Starting;
        }

        let bind_addr = (self.config.bind_addr, self.config.port);
        let bound = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(error) => Err(error),
        };
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(error) => {
                error!("Failed to start identd server: {error}");
                if *status == ServerStatus::Starting {
                    *status = ServerStatus::Idle;
                }
                return Err(IdentdError::Bind(error));
            }
        };
        if *status != ServerStatus::Starting {
            // Stopped while binding.
            return Err(IdentdError::NotRunning);
        }
        self.runtime.get_or_init(Handle::current);
        *status = ServerStatus::Running(local_addr);
        info!("Identd listening on {local_addr}");

        self.tasks.spawn(run_accept_loop(
            listener,
            self.registry.clone(),
            self.shutdown.clone(),
            self.tasks.clone(),
            self.config.read_timeout,
        ));
        Ok(local_addr)
    }

    /// Registers `username` as the owner of `local_port` until it is queried once or the TTL
    /// runs out, and asks the gateway to forward the ident port to `peer_addr`.
    ///
    /// Gateway failures never fail this call. May be called from any thread; the expiry timer
    /// runs on the runtime that started the server.
    pub fn add_user(&self, username: &str, local_port: u16, peer_addr: IpAddr) -> Result<(), IdentdError> {
        if local_port == 0 {
            return Err(IdentdError::InvalidPort(local_port));
        }
        if username.is_empty() || username.contains(['\r', '\n', '\0']) {
            return Err(IdentdError::InvalidUsername(username.to_string()));
        }

        // Held throughout so that stop() can't clear the registry in between.
        let status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        let (ServerStatus::Running(local_addr), Some(runtime)) = (*status, self.runtime.get()) else {
            return Err(IdentdError::NotRunning);
        };

        let ttl = self.config.user_ttl;
        let generation = self
            .registry
            .insert(local_port, username.to_string(), peer_addr, ttl);
        info!("Adding {username} ({local_port}) to identd");

        let external_port = self.config.external_port;
        self.port_mapper.add_mapping(MappingRequest {
            protocol: Protocol::Tcp,
            external_port,
            peer_addr,
            internal_port: local_addr.port(),
            lease_seconds: self.config.lease_seconds(),
            description: self.config.mapping_description.clone(),
        });

        let registry = self.registry.clone();
        let port_mapper = self.port_mapper.clone();
        let shutdown = self.shutdown.clone();
        let timer = async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(ttl) => {
                    on_timeout(&registry, &port_mapper, local_port, peer_addr, generation, external_port);
                }
            }
        };
        self.tasks.spawn_on(timer, runtime);
        Ok(())
    }

    /// Stops accepting, aborts in-flight exchanges and pending timers, forgets every user and
    /// releases the ident port mapping. Later calls do nothing.
    pub async fn stop(&self) {
        let was_running = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = *status;
            if previous == ServerStatus::Stopped {
                return;
            }
            *status = ServerStatus::Stopped;
            matches!(previous, ServerStatus::Running(_))
        };

        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.registry.clear();

        if was_running {
            self.port_mapper
                .remove_mapping(Protocol::Tcp, self.config.external_port, None);
        }
        self.port_mapper.close().await;
        info!("Identd server stopped");
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.status.lock().unwrap_or_else(PoisonError::into_inner) {
            ServerStatus::Running(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn subscribe_mappings(&self) -> broadcast::Receiver<MappingEvent> {
        self.port_mapper.subscribe()
    }

    /// Users registered and not yet queried or expired.
    pub fn pending_users(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for IdentdServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn on_timeout(
    registry: &UserRegistry,
    port_mapper: &PortMapper,
    local_port: u16,
    peer_addr: IpAddr,
    generation: u64,
    external_port: u16,
) {
    if registry.remove(local_port, generation) {
        debug!("Identd user on port {local_port} expired without a query");
    }
    // The mapping was taken for this call, whether or not the entry was answered.
    port_mapper.remove_mapping(Protocol::Tcp, external_port, Some(peer_addr));
}

async fn run_accept_loop(
    listener: TcpListener,
    registry: Arc<UserRegistry>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    read_timeout: Duration,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => result,
        };
        let (socket, addr) = match result {
            Ok(accepted) => accepted,
            Err(error) => {
                error!("Failed to accept ident connection: {error}");
                continue;
            }
        };
        debug!("Accepted ident connection from {addr}");

        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Dropping ident connection from {addr} on shutdown");
                }
                result = handle_connection(socket, addr, &registry, read_timeout) => match result {
                    Ok(()) => {}
                    Err(IdentdError::MalformedQuery(reason)) => {
                        debug!("Dropping ident connection from {addr}: {reason}");
                    }
                    Err(error) => debug!("Ident connection from {addr} failed: {error}"),
                },
            }
        });
    }
    debug!("Identd accept loop stopped");
}
