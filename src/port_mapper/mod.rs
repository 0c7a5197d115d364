use crate::port_mapper::event::{MappingError, MappingEvent};
use crate::port_mapper::gateway::{MappingRequest, PortGateway, Protocol};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::timeout;

pub mod event;
pub mod gateway;

const EVENT_CAPACITY: usize = 64;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Command {
    Add(MappingRequest),
    Remove {
        protocol: Protocol,
        external_port: u16,
        peer_addr: Option<IpAddr>,
    },
}

/// Serializes every call against a [`PortGateway`] through one background task.
///
/// Requests made while the gateway is still being discovered are queued. Outcomes are logged
/// once and broadcast to subscribers; callers never wait on them.
pub struct PortMapper {
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<MappingEvent>,
}

impl PortMapper {
    /// Starts the mapper task. `connect` runs on the blocking pool and may take as long as
    /// discovery needs. Must be called from within a tokio runtime.
    pub fn spawn<F>(connect: F) -> Self
    where
        F: FnOnce() -> Result<Arc<dyn PortGateway>, MappingError> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let task = {
            let events = events.clone();
            tokio::spawn(async move {
                run_mapper(connect, command_rx, events).await;
            })
        };
        Self {
            commands: Mutex::new(Some(command_tx)),
            task: tokio::sync::Mutex::new(Some(task)),
            events,
        }
    }

    pub fn with_gateway(gateway: Arc<dyn PortGateway>) -> Self {
        Self::spawn(move || Ok(gateway))
    }

    pub fn disabled() -> Self {
        Self::spawn(|| Err(MappingError::Disabled))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.events.subscribe()
    }

    pub fn add_mapping(&self, request: MappingRequest) {
        self.send(Command::Add(request));
    }

    /// Releases a mapping. With `peer_addr` set, only the lease taken for that peer is released
    /// and the gateway is called once no such lease remains; with `None` the mapping is removed
    /// outright.
    pub fn remove_mapping(&self, protocol: Protocol, external_port: u16, peer_addr: Option<IpAddr>) {
        self.send(Command::Remove {
            protocol,
            external_port,
            peer_addr,
        });
    }

    fn send(&self, command: Command) {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = match commands.as_ref() {
            Some(sender) => sender.send(command).map_err(|error| error.0),
            None => Err(command),
        };
        if let Err(command) = sent {
            debug!("Port mapper is closed, dropping {command:?}");
        }
    }

    /// Stops accepting requests, lets the queued ones finish and waits for the task to exit.
    pub async fn close(&self) {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = self.task.lock().await.take() {
            match timeout(CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => error!("Port mapper task failed: {error}"),
                Err(_) => warn!("Port mapper did not finish within {CLOSE_TIMEOUT:?}"),
            }
        }
    }
}

struct Lease {
    peer_addr: IpAddr,
    count: usize,
}

struct MapperState {
    gateway: Result<Arc<dyn PortGateway>, MappingError>,
    leases: HashMap<(Protocol, u16), Lease>,
    events: broadcast::Sender<MappingEvent>,
}

async fn run_mapper<F>(
    connect: F,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<MappingEvent>,
) where
    F: FnOnce() -> Result<Arc<dyn PortGateway>, MappingError> + Send + 'static,
{
    let gateway = match spawn_blocking(connect).await {
        Ok(result) => result,
        Err(error) => Err(MappingError::NotFound(format!("discovery task failed: {error}"))),
    };
    match &gateway {
        Ok(_) => info!("Port mapper ready"),
        Err(MappingError::Disabled) => info!("Port mapping disabled by request"),
        Err(error) => warn!("Port mapping unavailable: {error}"),
    }

    let mut state = MapperState {
        gateway,
        leases: HashMap::new(),
        events,
    };
    while let Some(command) = commands.recv().await {
        let event = match command {
            Command::Add(request) => Some(state.add(request).await),
            Command::Remove {
                protocol,
                external_port,
                peer_addr,
            } => state.remove(protocol, external_port, peer_addr).await,
        };
        if let Some(event) = event {
            log_event(&event);
            // No subscribers is fine.
            let _ = state.events.send(event);
        }
    }
    debug!("Port mapper stopped");
}

impl MapperState {
    async fn add(&mut self, request: MappingRequest) -> MappingEvent {
        let key = (request.protocol, request.external_port);
        match self.leases.get_mut(&key) {
            Some(lease) if lease.peer_addr == request.peer_addr => lease.count += 1,
            _ => {
                self.leases.insert(
                    key,
                    Lease {
                        peer_addr: request.peer_addr,
                        count: 1,
                    },
                );
            }
        }

        let gateway = match &self.gateway {
            Ok(gateway) => gateway.clone(),
            Err(error) => {
                return MappingEvent::MappingFailed {
                    request,
                    error: error.clone(),
                };
            }
        };
        let mut request = request;
        let mut result = add_port(&gateway, &request).await;
        if result == Err(MappingError::OnlyPermanentLeases) && request.lease_seconds != 0 {
            info!(
                "Gateway only supports permanent leases, mapping {} port {} without a lease",
                request.protocol, request.external_port
            );
            request.lease_seconds = 0;
            result = add_port(&gateway, &request).await;
        }
        match result {
            Ok(external_addr) => MappingEvent::Mapped {
                request,
                external_addr,
            },
            Err(error) => MappingEvent::MappingFailed { request, error },
        }
    }

    async fn remove(
        &mut self,
        protocol: Protocol,
        external_port: u16,
        peer_addr: Option<IpAddr>,
    ) -> Option<MappingEvent> {
        let key = (protocol, external_port);
        if let Some(peer) = peer_addr {
            match self.leases.get_mut(&key) {
                Some(lease) if lease.peer_addr == peer => {
                    lease.count -= 1;
                    if lease.count > 0 {
                        debug!(
                            "Keeping {protocol} port {external_port} mapped to {peer}, {} leases left",
                            lease.count
                        );
                        return None;
                    }
                    self.leases.remove(&key);
                }
                Some(lease) => {
                    debug!(
                        "{protocol} port {external_port} now forwards to {}, not removing it for {peer}",
                        lease.peer_addr
                    );
                    return None;
                }
                None => {
                    debug!("No lease on {protocol} port {external_port} for {peer}");
                    return None;
                }
            }
        } else {
            self.leases.remove(&key);
        }

        let result = match &self.gateway {
            Ok(gateway) => {
                let gateway = gateway.clone();
                spawn_blocking(move || gateway.remove_port(protocol, external_port))
                    .await
                    .unwrap_or_else(|error| {
                        Err(MappingError::Rejected(format!("gateway task failed: {error}")))
                    })
            }
            Err(error) => Err(error.clone()),
        };
        Some(match result {
            Ok(()) => MappingEvent::Removed {
                protocol,
                external_port,
                peer_addr,
            },
            Err(error) => MappingEvent::RemovalFailed {
                protocol,
                external_port,
                peer_addr,
                error,
            },
        })
    }
}

async fn add_port(
    gateway: &Arc<dyn PortGateway>,
    request: &MappingRequest,
) -> Result<SocketAddr, MappingError> {
    let gateway = gateway.clone();
    let request = request.clone();
    spawn_blocking(move || gateway.add_port(&request))
        .await
        .unwrap_or_else(|error| Err(MappingError::Rejected(format!("gateway task failed: {error}"))))
}

fn log_event(event: &MappingEvent) {
    match event {
        MappingEvent::Mapped {
            request,
            external_addr,
        } => info!(
            "Mapped {} port {external_addr} to {}:{}",
            request.protocol, request.peer_addr, request.internal_port
        ),
        MappingEvent::MappingFailed {
            error: MappingError::Disabled,
            ..
        } => {}
        MappingEvent::MappingFailed { request, error } => warn!(
            "Error mapping {} port {} to {}:{}: {error}",
            request.protocol, request.external_port, request.peer_addr, request.internal_port
        ),
        MappingEvent::Removed {
            protocol,
            external_port,
            ..
        } => info!("Removed mapping for {protocol} port {external_port}"),
        MappingEvent::RemovalFailed {
            error: MappingError::Disabled,
            ..
        } => {}
        MappingEvent::RemovalFailed {
            protocol,
            external_port,
            error,
            ..
        } => warn!("Error removing mapping for {protocol} port {external_port}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ALICE: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10));
    const BOB: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Add(IpAddr),
        Remove(u16),
    }

    #[derive(Default)]
    struct FakeGateway {
        calls: Mutex<Vec<Call>>,
        reject: bool,
        permanent_only: bool,
    }

    impl PortGateway for FakeGateway {
        fn add_port(&self, request: &MappingRequest) -> Result<SocketAddr, MappingError> {
            self.calls.lock().unwrap().push(Call::Add(request.peer_addr));
            if self.reject {
                return Err(MappingError::Rejected("ConflictInMappingEntry".to_string()));
            }
            if self.permanent_only && request.lease_seconds != 0 {
                return Err(MappingError::OnlyPermanentLeases);
            }
            Ok(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
                request.external_port,
            ))
        }

        fn remove_port(&self, _protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
            self.calls.lock().unwrap().push(Call::Remove(external_port));
            Ok(())
        }
    }

    fn request(peer_addr: IpAddr) -> MappingRequest {
        MappingRequest {
            protocol: Protocol::Tcp,
            external_port: 113,
            peer_addr,
            internal_port: 40113,
            lease_seconds: 180,
            description: "test".to_string(),
        }
    }

    fn drain(events: &mut broadcast::Receiver<MappingEvent>) -> Vec<MappingEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn queues_requests_during_discovery() {
        let gateway = Arc::new(FakeGateway::default());
        let mapper = {
            let gateway = gateway.clone();
            PortMapper::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                Ok(gateway as Arc<dyn PortGateway>)
            })
        };
        let mut events = mapper.subscribe();

        mapper.add_mapping(request(ALICE));
        mapper.close().await;

        assert_eq!(*gateway.calls.lock().unwrap(), vec![Call::Add(ALICE)]);
        match drain(&mut events).as_slice() {
            [MappingEvent::Mapped { external_addr, .. }] => {
                assert_eq!(external_addr.port(), 113);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn removes_only_after_last_lease() {
        let gateway = Arc::new(FakeGateway::default());
        let mapper = PortMapper::with_gateway(gateway.clone());

        mapper.add_mapping(request(ALICE));
        mapper.add_mapping(request(ALICE));
        mapper.remove_mapping(Protocol::Tcp, 113, Some(ALICE));
        mapper.remove_mapping(Protocol::Tcp, 113, Some(ALICE));
        mapper.remove_mapping(Protocol::Tcp, 113, Some(ALICE));
        mapper.close().await;

        assert_eq!(
            *gateway.calls.lock().unwrap(),
            vec![Call::Add(ALICE), Call::Add(ALICE), Call::Remove(113)]
        );
    }

    #[tokio::test]
    async fn superseded_peer_does_not_remove_mapping() {
        let gateway = Arc::new(FakeGateway::default());
        let mapper = PortMapper::with_gateway(gateway.clone());

        mapper.add_mapping(request(ALICE));
        mapper.add_mapping(request(BOB));
        mapper.remove_mapping(Protocol::Tcp, 113, Some(ALICE));
        mapper.remove_mapping(Protocol::Tcp, 113, Some(BOB));
        mapper.close().await;

        assert_eq!(
            *gateway.calls.lock().unwrap(),
            vec![Call::Add(ALICE), Call::Add(BOB), Call::Remove(113)]
        );
    }

    #[tokio::test]
    async fn unscoped_removal_always_reaches_gateway() {
        let gateway = Arc::new(FakeGateway::default());
        let mapper = PortMapper::with_gateway(gateway.clone());

        mapper.add_mapping(request(ALICE));
        mapper.remove_mapping(Protocol::Tcp, 113, None);
        mapper.remove_mapping(Protocol::Tcp, 113, Some(ALICE));
        mapper.close().await;

        assert_eq!(
            *gateway.calls.lock().unwrap(),
            vec![Call::Add(ALICE), Call::Remove(113)]
        );
    }

    #[tokio::test]
    async fn rejected_mapping_is_reported() {
        let gateway = Arc::new(FakeGateway {
            reject: true,
            ..Default::default()
        });
        let mapper = PortMapper::with_gateway(gateway);
        let mut events = mapper.subscribe();

        mapper.add_mapping(request(ALICE));
        mapper.close().await;

        assert!(matches!(
            drain(&mut events).as_slice(),
            [MappingEvent::MappingFailed {
                error: MappingError::Rejected(_),
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn falls_back_to_permanent_lease() {
        let gateway = Arc::new(FakeGateway {
            permanent_only: true,
            ..Default::default()
        });
        let mapper = PortMapper::with_gateway(gateway.clone());
        let mut events = mapper.subscribe();

        mapper.add_mapping(request(ALICE));
        mapper.close().await;

        assert_eq!(
            *gateway.calls.lock().unwrap(),
            vec![Call::Add(ALICE), Call::Add(ALICE)]
        );
        match drain(&mut events).as_slice() {
            [MappingEvent::Mapped { request, .. }] => assert_eq!(request.lease_seconds, 0),
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_gateway_fails_every_request() {
        let mapper = PortMapper::spawn(|| Err(MappingError::NotFound("timed out".to_string())));
        let mut events = mapper.subscribe();

        mapper.add_mapping(request(ALICE));
        mapper.remove_mapping(Protocol::Tcp, 113, Some(ALICE));
        mapper.close().await;

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], MappingEvent::MappingFailed { .. }));
        assert!(matches!(events[1], MappingEvent::RemovalFailed { .. }));
    }

    #[tokio::test]
    async fn requests_after_close_are_dropped() {
        let gateway = Arc::new(FakeGateway::default());
        let mapper = PortMapper::with_gateway(gateway.clone());

        mapper.close().await;
        mapper.add_mapping(request(ALICE));
        mapper.close().await;

        assert!(gateway.calls.lock().unwrap().is_empty());
    }
}
