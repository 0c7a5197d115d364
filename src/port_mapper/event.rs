use crate::port_mapper::gateway::{MappingRequest, Protocol};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingError {
    /// Port forwarding was turned off by configuration.
    Disabled,
    /// Gateway discovery failed.
    NotFound(String),
    /// The gateway refused the request or could not be reached.
    Rejected(String),
    /// The gateway only accepts mappings with an infinite lease.
    OnlyPermanentLeases,
}

impl Display for MappingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingError::Disabled => f.write_str("port mapping is disabled"),
            MappingError::NotFound(reason) => write!(f, "no gateway found: {reason}"),
            MappingError::Rejected(reason) => write!(f, "gateway error: {reason}"),
            MappingError::OnlyPermanentLeases => f.write_str("gateway only supports permanent leases"),
        }
    }
}

impl std::error::Error for MappingError {}

/// Outcome of a gateway call, keyed by the mapping it concerns rather than by the call that
/// caused it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingEvent {
    Mapped {
        request: MappingRequest,
        external_addr: SocketAddr,
    },
    MappingFailed {
        request: MappingRequest,
        error: MappingError,
    },
    Removed {
        protocol: Protocol,
        external_port: u16,
        peer_addr: Option<IpAddr>,
    },
    RemovalFailed {
        protocol: Protocol,
        external_port: u16,
        peer_addr: Option<IpAddr>,
        error: MappingError,
    },
}
