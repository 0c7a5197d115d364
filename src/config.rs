use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Well-known ident port (RFC 1413).
pub const IDENT_PORT: u16 = 113;

/// How long a registered user stays answerable. Matches the lease requested from the gateway.
pub const USER_TTL: Duration = Duration::from_secs(180);

pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct IdentdConfig {
    pub bind_addr: IpAddr,
    /// Port to listen on. `0` picks any available port.
    pub port: u16,
    pub external_port: u16,
    pub user_ttl: Duration,
    pub read_timeout: Duration,
    pub mapping_description: String,
}

impl Default for IdentdConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            external_port: IDENT_PORT,
            user_ttl: USER_TTL,
            read_timeout: READ_TIMEOUT,
            mapping_description: "Identd server".to_string(),
        }
    }
}

impl IdentdConfig {
    /// Lease in whole seconds, as the gateway wants it. Never zero, since zero means permanent.
    pub fn lease_seconds(&self) -> u32 {
        self.user_ttl.as_secs().clamp(1, u32::MAX as u64) as u32
    }
}
