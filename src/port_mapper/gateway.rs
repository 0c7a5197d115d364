use crate::port_mapper::event::MappingError;
use igd_next::{AddPortError, PortMappingProtocol, SearchOptions};
use log::info;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

impl From<Protocol> for PortMappingProtocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => PortMappingProtocol::TCP,
            Protocol::Udp => PortMappingProtocol::UDP,
        }
    }
}

/// One forwarding rule: `external_port` on the gateway to `peer_addr:internal_port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingRequest {
    pub protocol: Protocol,
    pub external_port: u16,
    pub peer_addr: IpAddr,
    pub internal_port: u16,
    pub lease_seconds: u32,
    pub description: String,
}

/// Port forwarding capability of a NAT gateway. Calls may block on network I/O.
pub trait PortGateway: Send + Sync + 'static {
    /// Installs or refreshes a mapping and returns the external address it was granted on.
    fn add_port(&self, request: &MappingRequest) -> Result<SocketAddr, MappingError>;

    fn remove_port(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError>;
}

/// A UPnP Internet Gateway Device found on the local network.
pub struct IgdGateway {
    gateway: igd_next::Gateway,
}

impl IgdGateway {
    pub fn discover(timeout: Duration) -> Result<Self, MappingError> {
        let gateway = igd_next::search_gateway(SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        })
        .map_err(|error| MappingError::NotFound(error.to_string()))?;
        info!("Discovered UPnP gateway at {}", gateway.addr);
        Ok(Self { gateway })
    }
}

impl PortGateway for IgdGateway {
    fn add_port(&self, request: &MappingRequest) -> Result<SocketAddr, MappingError> {
        self.gateway
            .add_port(
                request.protocol.into(),
                request.external_port,
                SocketAddr::new(request.peer_addr, request.internal_port),
                request.lease_seconds,
                &request.description,
            )
            .map_err(|error| match error {
                AddPortError::OnlyPermanentLeasesSupported => MappingError::OnlyPermanentLeases,
                error => MappingError::Rejected(error.to_string()),
            })?;
        let external_ip = self
            .gateway
            .get_external_ip()
            .map_err(|error| MappingError::Rejected(error.to_string()))?;
        Ok(SocketAddr::new(external_ip, request.external_port))
    }

    fn remove_port(&self, protocol: Protocol, external_port: u16) -> Result<(), MappingError> {
        self.gateway
            .remove_port(protocol.into(), external_port)
            .map_err(|error| MappingError::Rejected(error.to_string()))
    }
}
